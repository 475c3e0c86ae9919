use tracing::{debug, warn};

use crate::config::RangeMeanRevConfig;
use crate::indicators::{calculate_bollinger, FeatureSeries, BB_PERIOD, BB_STD_DEVS};
use crate::models::{Bar, EntrySignal, Regime, RegimeResult, Side, Signal};

use super::Strategy;

const SR_LOOKBACK: usize = 20;
const SR_ZONE_PCT: f64 = 0.005;

/// Fades Bollinger-band excursions inside a confirmed range.
///
/// Longs want a lower-band pierce that closed back inside with RSI washed
/// out; shorts mirror at the upper band. The target is the mid band, and a
/// signal is dropped when that leaves less than 1:1 reward-to-risk or when a
/// swing level sits right in front of the target.
pub struct RangeMeanReversion {
    cfg: RangeMeanRevConfig,
}

impl RangeMeanReversion {
    pub fn new(cfg: RangeMeanRevConfig) -> Self {
        Self { cfg }
    }

    fn stop_buffer(&self, close: f64, atr: f64) -> f64 {
        (self.cfg.atr_mult * atr).max(self.cfg.min_sl_pct * close)
    }

    fn build_entry(
        &self,
        regime: &RegimeResult,
        features: &FeatureSeries,
        side: Side,
        entry: f64,
        stop_loss: f64,
        take_profit: f64,
        bars: &[Bar],
    ) -> Signal {
        let risk = match side {
            Side::Buy => entry - stop_loss,
            Side::Sell => stop_loss - entry,
        };
        if risk <= 0.0 {
            return Signal::None;
        }

        let stop_pct = risk / entry;
        if stop_pct > self.cfg.max_sl_pct {
            warn!(
                "🚫 {} range {:?} rejected: stop distance {:.2}% above cap",
                regime.symbol,
                side,
                stop_pct * 100.0
            );
            return Signal::None;
        }

        let reward = match side {
            Side::Buy => take_profit - entry,
            Side::Sell => entry - take_profit,
        };
        if reward < risk {
            debug!(
                "🚫 {} range {:?} rejected: RR {:.2} below 1.0",
                regime.symbol,
                side,
                reward / risk
            );
            return Signal::None;
        }

        if self.target_blocked(bars, entry, take_profit, side) {
            debug!(
                "🚫 {} range {:?} rejected: swing level in front of target",
                regime.symbol, side
            );
            return Signal::None;
        }

        let reason = match side {
            Side::Buy => "range long: lower-band rejection + RSI",
            Side::Sell => "range short: upper-band rejection + RSI",
        };
        Signal::Entry(EntrySignal {
            symbol: regime.symbol.clone(),
            side,
            entry_price: entry,
            stop_loss,
            take_profit,
            confidence: regime.confidence,
            atr: Some(features.atr),
            reason: reason.to_string(),
        })
    }

    /// True when a recent swing high (for longs) or low (for shorts) sits
    /// between entry and target, close enough to the target to cap the move.
    fn target_blocked(&self, bars: &[Bar], entry: f64, target: f64, side: Side) -> bool {
        let levels = match side {
            Side::Buy => swing_highs(bars, SR_LOOKBACK),
            Side::Sell => swing_lows(bars, SR_LOOKBACK),
        };
        let zone = SR_ZONE_PCT * entry;
        levels.iter().any(|&level| {
            let between = match side {
                Side::Buy => entry < level && level < target,
                Side::Sell => target < level && level < entry,
            };
            between && (target - level).abs() < zone
        })
    }
}

fn swing_highs(bars: &[Bar], lookback: usize) -> Vec<f64> {
    swing_levels(bars, lookback, |window| {
        let high = window[1].high;
        (high > window[0].high && high > window[2].high).then_some(high)
    })
}

fn swing_lows(bars: &[Bar], lookback: usize) -> Vec<f64> {
    swing_levels(bars, lookback, |window| {
        let low = window[1].low;
        (low < window[0].low && low < window[2].low).then_some(low)
    })
}

fn swing_levels<F>(bars: &[Bar], lookback: usize, pick: F) -> Vec<f64>
where
    F: Fn(&[Bar]) -> Option<f64>,
{
    if bars.len() < 4 {
        return Vec::new();
    }
    // Exclude the live bar; scan three-bar pivots over the lookback.
    let end = bars.len() - 1;
    let start = end.saturating_sub(lookback);
    bars[start..end].windows(3).filter_map(|w| pick(w)).collect()
}

impl Strategy for RangeMeanReversion {
    fn name(&self) -> &'static str {
        "range_mean_reversion"
    }

    fn generate(&self, bars: &[Bar], features: &FeatureSeries, regime: &RegimeResult) -> Signal {
        if bars.is_empty() || regime.confirmed != Regime::Range {
            return Signal::None;
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let Some(bands) = calculate_bollinger(&closes, BB_PERIOD, BB_STD_DEVS) else {
            return Signal::None;
        };

        let current = &bars[bars.len() - 1];
        let close = current.close;
        let rsi = features.rsi;
        let atr = features.atr;

        if current.low < bands.lower && close > bands.lower && rsi < self.cfg.rsi_long_max {
            let stop_loss = current.low - self.stop_buffer(close, atr);
            return self.build_entry(
                regime,
                features,
                Side::Buy,
                close,
                stop_loss,
                bands.middle,
                bars,
            );
        }

        if current.high > bands.upper && close < bands.upper && rsi > self.cfg.rsi_short_min {
            let stop_loss = current.high + self.stop_buffer(close, atr);
            return self.build_entry(
                regime,
                features,
                Side::Sell,
                close,
                stop_loss,
                bands.middle,
                bars,
            );
        }

        Signal::None
    }
}
