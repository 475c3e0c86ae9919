use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use tracing::{debug, error, warn};

use crate::models::Bar;

/// Callback fired when a bar closes. Errors are logged and never propagated
/// back into the stream task.
pub type BarCloseCallback = Box<dyn Fn(&str, &str, &Bar) -> crate::Result<()> + Send + Sync>;

type StreamKey = (String, String);

/// Rolling per-(symbol, timeframe) bar windows shared between the stream
/// task and the decision loops.
///
/// The latest bar in a window may still be forming; stream updates replace it
/// in place until the exchange marks it closed, after which the next bar is
/// appended and the oldest evicted.
pub struct MarketDataCache {
    bars: RwLock<HashMap<StreamKey, VecDeque<Bar>>>,
    capacity: usize,
    on_close: RwLock<Vec<BarCloseCallback>>,
}

impl MarketDataCache {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            bars: RwLock::new(HashMap::new()),
            capacity,
            on_close: RwLock::new(Vec::new()),
        })
    }

    /// Register a callback invoked on every bar close.
    pub fn on_bar_close(&self, cb: BarCloseCallback) {
        match self.on_close.write() {
            Ok(mut cbs) => cbs.push(cb),
            Err(e) => error!("bar-close callback registry poisoned: {}", e),
        }
    }

    /// Replace the whole window for a stream with history fetched over REST.
    /// Keeps only the newest `capacity` bars.
    pub fn preload(&self, symbol: &str, timeframe: &str, mut bars: Vec<Bar>) {
        bars.sort_by_key(|b| b.open_time);
        if bars.len() > self.capacity {
            bars.drain(..bars.len() - self.capacity);
        }
        let count = bars.len();
        if let Ok(mut map) = self.bars.write() {
            map.insert(
                (symbol.to_string(), timeframe.to_string()),
                bars.into_iter().collect(),
            );
        }
        debug!("📊 Preloaded {} bars for {} {}", count, symbol, timeframe);
    }

    /// Apply a streamed bar update.
    ///
    /// Same open_time as the latest cached bar replaces it in place; an older
    /// open_time is stale and dropped; a newer one is appended with eviction
    /// at capacity. Fires close callbacks when the update is a closed bar.
    pub fn apply_update(&self, symbol: &str, timeframe: &str, bar: Bar) {
        let closed = bar.closed;
        let fired = {
            let mut map = match self.bars.write() {
                Ok(map) => map,
                Err(e) => {
                    error!("bar cache poisoned: {}", e);
                    return;
                }
            };
            let window = map
                .entry((symbol.to_string(), timeframe.to_string()))
                .or_default();

            let last_open = window.back().map(|b| b.open_time);
            match last_open {
                Some(t) if bar.open_time == t => {
                    if let Some(last) = window.back_mut() {
                        *last = bar.clone();
                    }
                }
                Some(t) if bar.open_time < t => {
                    warn!(
                        "⚠️ Dropping stale bar for {} {}: {} < {}",
                        symbol, timeframe, bar.open_time, t
                    );
                    return;
                }
                _ => {
                    window.push_back(bar.clone());
                    while window.len() > self.capacity {
                        window.pop_front();
                    }
                }
            }
            closed
        };

        if fired {
            self.fire_close(symbol, timeframe, &bar);
        }
    }

    fn fire_close(&self, symbol: &str, timeframe: &str, bar: &Bar) {
        let cbs = match self.on_close.read() {
            Ok(cbs) => cbs,
            Err(e) => {
                error!("bar-close callback registry poisoned: {}", e);
                return;
            }
        };
        for cb in cbs.iter() {
            if let Err(e) = cb(symbol, timeframe, bar) {
                error!("❌ Bar-close callback failed for {} {}: {}", symbol, timeframe, e);
            }
        }
    }

    /// Owned copy of the current window, oldest first. Empty if the stream
    /// has no data yet.
    pub fn snapshot(&self, symbol: &str, timeframe: &str) -> Vec<Bar> {
        self.bars
            .read()
            .ok()
            .and_then(|map| {
                map.get(&(symbol.to_string(), timeframe.to_string()))
                    .map(|w| w.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// Number of cached bars for a stream.
    pub fn len(&self, symbol: &str, timeframe: &str) -> usize {
        self.bars
            .read()
            .ok()
            .and_then(|map| {
                map.get(&(symbol.to_string(), timeframe.to_string()))
                    .map(VecDeque::len)
            })
            .unwrap_or(0)
    }
}
