//! Entry strategies and the regime-gated router.

mod range_meanrev;
mod router;
mod trend_pullback;

pub use range_meanrev::RangeMeanReversion;
pub use router::StrategyRouter;
pub use trend_pullback::TrendPullback;

use crate::indicators::FeatureSeries;
use crate::models::{Bar, RegimeResult, Signal};

/// A pure signal generator. Strategies never talk to the exchange; they look
/// at bars and features and either propose a fully-specified entry or stay
/// silent.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate(&self, bars: &[Bar], features: &FeatureSeries, regime: &RegimeResult) -> Signal;
}
