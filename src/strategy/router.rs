use tracing::info;

use crate::config::StrategiesConfig;
use crate::indicators::FeatureSeries;
use crate::models::{Bar, Regime, RegimeResult, Signal};

use super::{RangeMeanReversion, Strategy, TrendPullback};

/// Dispatches each confirmed regime to at most one strategy. SQUEEZE and
/// NO_TRADE route nowhere: squeezes are breakout-ready but direction is
/// unknown, so the bot stands aside.
pub struct StrategyRouter {
    cfg: StrategiesConfig,
    trend: TrendPullback,
    range: RangeMeanReversion,
}

impl StrategyRouter {
    pub fn new(cfg: StrategiesConfig) -> Self {
        let trend = TrendPullback::new(cfg.trend_pullback.clone());
        let range = RangeMeanReversion::new(cfg.range_mean_reversion.clone());
        Self { cfg, trend, range }
    }

    /// Route one symbol's snapshot to the strategy owning its confirmed
    /// regime. Only confirmed labels route; a proposed-but-unconfirmed
    /// regime never trades.
    pub fn check_signal(
        &self,
        bars: &[Bar],
        features: &FeatureSeries,
        regime: &RegimeResult,
    ) -> Signal {
        let (strategy, enabled): (&dyn Strategy, bool) = match regime.confirmed {
            Regime::TrendBull | Regime::TrendBear => {
                (&self.trend, self.cfg.trend_pullback.enabled)
            }
            Regime::Range => (&self.range, self.cfg.range_mean_reversion.enabled),
            Regime::Squeeze | Regime::NoTrade => return Signal::None,
        };
        if !enabled {
            return Signal::None;
        }

        let signal = strategy.generate(bars, features, regime);
        if let Signal::Entry(ref entry) = signal {
            info!(
                "🎯 Signal [{}] {} {} @ {:.4} (sl={:.4} tp={:.4}, {})",
                entry.symbol,
                strategy.name(),
                entry.side,
                entry.entry_price,
                entry.stop_loss,
                entry.take_profit,
                entry.reason
            );
        }
        signal
    }
}
