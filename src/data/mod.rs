//! In-memory market data: the bar cache fed by the websocket stream and
//! preloaded over REST at startup.

mod cache;

pub use cache::{BarCloseCallback, MarketDataCache};
