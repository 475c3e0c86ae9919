//! Technical indicators over bar history.
//!
//! All series are newest-last and aligned so the final entry corresponds to
//! the final input bar; each module documents its own warm-up offset.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod rsi;

pub use adx::{adx_series, calculate_adx};
pub use atr::calculate_atr;
pub use bollinger::{bandwidth_series, calculate_bollinger, BollingerBands};
pub use ema::{at_offset, calculate_ema, ema_series};
pub use rsi::calculate_rsi;

use crate::models::Bar;

pub const ADX_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const RSI_PERIOD: usize = 14;
pub const BB_PERIOD: usize = 20;
pub const BB_STD_DEVS: f64 = 2.0;
pub const EMA_FAST: usize = 20;
pub const EMA_SLOW: usize = 50;

/// Everything the classifier and strategies need, computed once per cycle
/// from a bar snapshot.
#[derive(Debug, Clone)]
pub struct FeatureSeries {
    /// ADX values, newest last. Used both as the latest reading and as the
    /// rolling window for quantile thresholds.
    pub adx: Vec<f64>,
    /// Normalized Bollinger bandwidth values, newest last.
    pub bb_width: Vec<f64>,
    /// Fast EMA series, newest last.
    pub ema_fast: Vec<f64>,
    /// Slow EMA series, newest last.
    pub ema_slow: Vec<f64>,
    /// Latest EMA separation in percent: (fast - slow) / slow * 100.
    pub ema_sep: f64,
    /// Latest +DI reading.
    pub plus_di: f64,
    /// Latest -DI reading.
    pub minus_di: f64,
    /// Latest RSI reading.
    pub rsi: f64,
    /// Latest ATR reading.
    pub atr: f64,
}

impl FeatureSeries {
    /// Compute the full feature set from a snapshot of closed bars.
    ///
    /// Returns None when any component lacks warm-up history; callers treat
    /// that the same as "not enough data".
    pub fn compute(bars: &[Bar]) -> Option<FeatureSeries> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let adx = adx_series(bars, ADX_PERIOD);
        if adx.is_empty() {
            return None;
        }
        let (_, plus_di, minus_di) = calculate_adx(bars, ADX_PERIOD)?;

        let bb_width = bandwidth_series(&closes, BB_PERIOD, BB_STD_DEVS);
        if bb_width.is_empty() {
            return None;
        }

        let ema_fast = ema_series(&closes, EMA_FAST);
        let ema_slow = ema_series(&closes, EMA_SLOW);
        let fast = *ema_fast.last()?;
        let slow = *ema_slow.last()?;
        let ema_sep = if slow.abs() < f64::EPSILON {
            0.0
        } else {
            (fast - slow) / slow * 100.0
        };

        let rsi = calculate_rsi(&closes, RSI_PERIOD)?;
        let atr = calculate_atr(bars, ATR_PERIOD)?;

        Some(FeatureSeries {
            adx,
            bb_width,
            ema_fast,
            ema_slow,
            ema_sep,
            plus_di,
            minus_di,
            rsi,
            atr,
        })
    }

    /// Latest ADX reading.
    pub fn adx_now(&self) -> f64 {
        self.adx.last().copied().unwrap_or(0.0)
    }

    /// Latest bandwidth reading.
    pub fn bb_width_now(&self) -> f64 {
        self.bb_width.last().copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
pub(crate) fn test_bars(ohlc: &[(f64, f64, f64, f64)]) -> Vec<Bar> {
    use chrono::{Duration, TimeZone, Utc};

    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    ohlc.iter()
        .enumerate()
        .map(|(i, &(open, high, low, close))| Bar {
            open_time: start + Duration::hours(i as i64),
            open,
            high,
            low,
            close,
            volume: 1000.0,
            closed: true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uptrend(n: usize) -> Vec<Bar> {
        test_bars(
            &(0..n)
                .map(|i| {
                    let base = 100.0 + i as f64 * 1.5;
                    (base, base + 2.0, base - 1.0, base + 1.0)
                })
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_compute_on_uptrend() {
        let features = FeatureSeries::compute(&uptrend(120)).unwrap();
        assert!(features.adx_now() > 25.0);
        assert!(features.ema_sep > 0.0);
        assert!(features.plus_di > features.minus_di);
        assert!(features.rsi > 50.0);
        assert!(features.atr > 0.0);
        // Series end aligned with the latest bar.
        assert!(!features.bb_width.is_empty());
    }

    #[test]
    fn test_compute_needs_warmup() {
        // Slow EMA needs 50 bars; 40 is not enough.
        assert!(FeatureSeries::compute(&uptrend(40)).is_none());
        assert!(FeatureSeries::compute(&[]).is_none());
    }
}
