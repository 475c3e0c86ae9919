use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::{error, info};

/// Latch that stops all new entries once a hard risk limit is breached.
///
/// Activation is sticky for the process lifetime; only an explicit
/// [`reset`](KillSwitch::reset) clears it. Exits and protective orders keep
/// working while it is active.
#[derive(Debug, Default)]
pub struct KillSwitch {
    active: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self, reason: &str) {
        self.active.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.reason.lock() {
            *slot = Some(reason.to_string());
        }
        error!("🛑 KILL-SWITCH ACTIVATED: {}", reason);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn reset(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.reason.lock() {
            *slot = None;
        }
        info!("Kill-switch has been reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_is_sticky_until_reset() {
        let ks = KillSwitch::new();
        assert!(!ks.is_active());

        ks.activate("daily drawdown breached");
        assert!(ks.is_active());
        assert_eq!(ks.reason().as_deref(), Some("daily drawdown breached"));

        // Still active until explicitly reset.
        assert!(ks.is_active());
        ks.reset();
        assert!(!ks.is_active());
        assert!(ks.reason().is_none());
    }
}
