//! Order orchestration: turning an approved entry signal into an exchange
//! position wrapped in protective orders.

mod executor;
mod leases;

pub use executor::Executor;
pub use leases::ProtectionLeases;
