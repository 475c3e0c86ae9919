use tracing::debug;

use crate::config::TrendPullbackConfig;
use crate::indicators::{at_offset, FeatureSeries};
use crate::models::{Bar, EntrySignal, Regime, RegimeResult, Side, Signal};

use super::Strategy;

/// Buys pullbacks to the fast EMA in a confirmed uptrend (and mirrors for
/// downtrends).
///
/// A valid long needs the previous bar to have dipped below the fast EMA,
/// the current bar to close back above it with its low still near the EMA,
/// RSI below the overbought cutoff, and price to have been above the EMA
/// before the pullback started.
pub struct TrendPullback {
    cfg: TrendPullbackConfig,
}

impl TrendPullback {
    pub fn new(cfg: TrendPullbackConfig) -> Self {
        Self { cfg }
    }
}

impl Strategy for TrendPullback {
    fn name(&self) -> &'static str {
        "trend_pullback"
    }

    fn generate(&self, bars: &[Bar], features: &FeatureSeries, regime: &RegimeResult) -> Signal {
        if bars.len() < 3 || !regime.confirmed.is_trend() {
            return Signal::None;
        }

        let current = &bars[bars.len() - 1];
        let prev = &bars[bars.len() - 2];
        let prev2 = &bars[bars.len() - 3];

        let close = current.close;
        let Some(ema_fast) = at_offset(&features.ema_fast, 0) else {
            return Signal::None;
        };
        // EMA as it stood two bars ago, for the pre-pullback trend check.
        let Some(ema_fast_prev2) = at_offset(&features.ema_fast, 2) else {
            return Signal::None;
        };
        let rsi = features.rsi;

        if regime.confirmed == Regime::TrendBull {
            let pullback_occurred = prev.low < ema_fast;
            let bounce_confirmed = close > ema_fast && current.low < ema_fast * 1.002;
            let rsi_valid = rsi < self.cfg.rsi_overbought;
            let was_above = prev2.close > ema_fast_prev2;

            if pullback_occurred && bounce_confirmed && rsi_valid && was_above {
                let stop_loss = current.low.min(prev.low) * 0.995;
                let risk = close - stop_loss;
                debug!(
                    "📈 {} pullback long: close={:.4} ema={:.4} rsi={:.1}",
                    regime.symbol, close, ema_fast, rsi
                );
                return Signal::Entry(EntrySignal {
                    symbol: regime.symbol.clone(),
                    side: Side::Buy,
                    entry_price: close,
                    stop_loss,
                    take_profit: close + risk * self.cfg.reward_ratio,
                    confidence: regime.confidence,
                    atr: Some(features.atr),
                    reason: "trend pullback long: EMA bounce confirmed".to_string(),
                });
            }
        } else {
            let pullback_occurred = prev.high > ema_fast;
            let bounce_confirmed = close < ema_fast && current.high > ema_fast * 0.998;
            let rsi_valid = rsi > self.cfg.rsi_oversold;
            let was_below = prev2.close < ema_fast_prev2;

            if pullback_occurred && bounce_confirmed && rsi_valid && was_below {
                let stop_loss = current.high.max(prev.high) * 1.005;
                let risk = stop_loss - close;
                debug!(
                    "📉 {} pullback short: close={:.4} ema={:.4} rsi={:.1}",
                    regime.symbol, close, ema_fast, rsi
                );
                return Signal::Entry(EntrySignal {
                    symbol: regime.symbol.clone(),
                    side: Side::Sell,
                    entry_price: close,
                    stop_loss,
                    take_profit: close - risk * self.cfg.reward_ratio,
                    confidence: regime.confidence,
                    atr: Some(features.atr),
                    reason: "trend pullback short: EMA rejection confirmed".to_string(),
                });
            }
        }

        Signal::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RegimeFeatures;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(i),
            open,
            high,
            low,
            close,
            volume: 100.0,
            closed: true,
        }
    }

    fn regime(confirmed: Regime) -> RegimeResult {
        RegimeResult {
            symbol: "BTCUSDT".to_string(),
            confirmed,
            proposed: confirmed,
            confidence: 0.8,
            features: RegimeFeatures::default(),
            reason: "test".to_string(),
        }
    }

    /// EMA pinned at 100 at both offsets; RSI neutral.
    fn features(rsi: f64) -> FeatureSeries {
        FeatureSeries {
            adx: vec![30.0],
            bb_width: vec![0.05],
            ema_fast: vec![100.0, 100.0, 100.0],
            ema_slow: vec![95.0],
            ema_sep: 5.0,
            plus_di: 30.0,
            minus_di: 10.0,
            rsi,
            atr: 1.5,
        }
    }

    /// prev2 above EMA, prev dips below, current closes back above.
    fn pullback_bars() -> Vec<Bar> {
        vec![
            bar(0, 102.0, 103.0, 101.0, 102.0),
            bar(1, 102.0, 102.5, 99.0, 99.5),
            bar(2, 99.5, 101.5, 99.8, 101.0),
        ]
    }

    #[test]
    fn test_long_pullback_entry() {
        let strat = TrendPullback::new(TrendPullbackConfig::default());
        let signal = strat.generate(&pullback_bars(), &features(55.0), &regime(Regime::TrendBull));
        let Signal::Entry(entry) = signal else {
            panic!("expected entry signal");
        };
        assert_eq!(entry.side, Side::Buy);
        assert_eq!(entry.entry_price, 101.0);
        // Stop under the lower of the last two lows, with buffer.
        assert!((entry.stop_loss - 99.0 * 0.995).abs() < 1e-9);
        // RR 1:2 above entry.
        let risk = entry.entry_price - entry.stop_loss;
        assert!((entry.take_profit - (101.0 + risk * 2.0)).abs() < 1e-9);
        assert!(entry.levels_valid());
    }

    #[test]
    fn test_overbought_rsi_blocks_long() {
        let strat = TrendPullback::new(TrendPullbackConfig::default());
        let signal = strat.generate(&pullback_bars(), &features(75.0), &regime(Regime::TrendBull));
        assert!(signal.is_none());
    }

    #[test]
    fn test_no_entry_without_pullback() {
        let strat = TrendPullback::new(TrendPullbackConfig::default());
        // All bars comfortably above the EMA, no dip.
        let bars = vec![
            bar(0, 104.0, 105.0, 103.0, 104.0),
            bar(1, 104.0, 106.0, 103.5, 105.0),
            bar(2, 105.0, 107.0, 104.5, 106.0),
        ];
        let signal = strat.generate(&bars, &features(55.0), &regime(Regime::TrendBull));
        assert!(signal.is_none());
    }

    #[test]
    fn test_non_trend_regime_is_silent() {
        let strat = TrendPullback::new(TrendPullbackConfig::default());
        let signal = strat.generate(&pullback_bars(), &features(55.0), &regime(Regime::Range));
        assert!(signal.is_none());
    }

    #[test]
    fn test_short_pullback_entry() {
        let strat = TrendPullback::new(TrendPullbackConfig::default());
        // Mirror image: prev2 below EMA, prev pops above, current closes back
        // below with its high near the EMA.
        let bars = vec![
            bar(0, 98.0, 99.0, 97.0, 98.0),
            bar(1, 98.0, 101.0, 97.5, 100.5),
            bar(2, 100.5, 100.2, 98.5, 99.0),
        ];
        let signal = strat.generate(&bars, &features(45.0), &regime(Regime::TrendBear));
        let Signal::Entry(entry) = signal else {
            panic!("expected entry signal");
        };
        assert_eq!(entry.side, Side::Sell);
        assert!((entry.stop_loss - 101.0 * 1.005).abs() < 1e-9);
        assert!(entry.levels_valid());
    }
}
