use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Short-lived per-symbol leases taken while the executor is still placing
/// protective orders for a fresh entry.
///
/// Reconciliation checks the lease before healing a "missing" stop or
/// target, so it cannot race orders that are merely in flight. Orphan
/// cancellation ignores leases.
pub struct ProtectionLeases {
    ttl: Duration,
    held: Mutex<HashMap<String, Instant>>,
}

impl ProtectionLeases {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Take (or refresh) the lease for a symbol.
    pub fn grant(&self, symbol: &str) {
        if let Ok(mut held) = self.held.lock() {
            held.insert(symbol.to_string(), Instant::now());
        }
    }

    /// True while the symbol's lease has not expired.
    pub fn is_held(&self, symbol: &str) -> bool {
        let Ok(mut held) = self.held.lock() else {
            return false;
        };
        match held.get(symbol) {
            Some(granted) if granted.elapsed() < self.ttl => true,
            Some(_) => {
                held.remove(symbol);
                false
            }
            None => false,
        }
    }

    /// Drop a lease early, once protective orders are confirmed on-book.
    pub fn release(&self, symbol: &str) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(symbol);
        }
    }
}
