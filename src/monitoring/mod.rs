//! Background safety loops: reconciliation, closure detection, heartbeat.

mod health;
mod position_monitor;
mod reconciliation;

pub use health::HealthMonitor;
pub use position_monitor::PositionMonitor;
pub use reconciliation::{ReconciliationLoop, ReconciliationReport};
