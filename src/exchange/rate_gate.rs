use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use governor::{Quota, RateLimiter};
use tracing::warn;

const REQUEST_WEIGHT_PER_MINUTE: u32 = 1200;
const MAX_BACKOFF_SECS: u64 = 300;

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Paces outgoing REST requests and backs off after repeated rate-limit
/// responses. Shared by every request the gateway makes.
pub struct RateGate {
    limiter: DirectLimiter,
    consecutive_limits: AtomicU32,
}

impl RateGate {
    pub fn new() -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(REQUEST_WEIGHT_PER_MINUTE).unwrap_or(NonZeroU32::MIN),
        );
        Self {
            limiter: RateLimiter::direct(quota),
            consecutive_limits: AtomicU32::new(0),
        }
    }

    /// Wait until a request may be sent. After rate-limit responses this also
    /// sleeps an exponential penalty, doubling per consecutive hit and capped
    /// at five minutes.
    pub async fn acquire(&self) {
        let strikes = self.consecutive_limits.load(Ordering::Relaxed);
        if strikes > 0 {
            let penalty = 2u64
                .saturating_pow(strikes.min(16))
                .min(MAX_BACKOFF_SECS);
            warn!(
                "⏳ Backing off {}s after {} consecutive rate limits",
                penalty, strikes
            );
            tokio::time::sleep(Duration::from_secs(penalty)).await;
        }
        self.limiter.until_ready().await;
    }

    pub fn report_success(&self) {
        self.consecutive_limits.store(0, Ordering::Relaxed);
    }

    pub fn report_rate_limit(&self) {
        self.consecutive_limits.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_is_immediate_without_strikes() {
        let gate = RateGate::new();
        let start = std::time::Instant::now();
        gate.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_penalty_grows_and_resets() {
        let gate = RateGate::new();
        gate.report_rate_limit();
        gate.report_rate_limit();

        let start = tokio::time::Instant::now();
        gate.acquire().await;
        // Two strikes -> 4s penalty under paused time.
        assert!(start.elapsed() >= Duration::from_secs(4));

        gate.report_success();
        let start = tokio::time::Instant::now();
        gate.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
