//! Average Directional Index: trend strength with +DI/-DI direction.
//!
//! ADX near 0 means a flat or choppy market; values above the recent upper
//! quantile mark a directional move. The classifier consumes the full ADX
//! series so it can compute rolling quantile thresholds.

use crate::models::Bar;

struct DirectionalInputs {
    true_ranges: Vec<f64>,
    plus_dms: Vec<f64>,
    minus_dms: Vec<f64>,
}

fn directional_inputs(bars: &[Bar]) -> DirectionalInputs {
    let n = bars.len().saturating_sub(1);
    let mut true_ranges = Vec::with_capacity(n);
    let mut plus_dms = Vec::with_capacity(n);
    let mut minus_dms = Vec::with_capacity(n);

    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        true_ranges.push(
            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs()),
        );

        let up_move = high - bars[i - 1].high;
        let down_move = bars[i - 1].low - low;

        plus_dms.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dms.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
    }

    DirectionalInputs {
        true_ranges,
        plus_dms,
        minus_dms,
    }
}

/// Full ADX series (Wilder smoothing of DX), newest last.
///
/// Entry `k` corresponds to bar index `2 * period - 1 + k` of the input
/// slice; the last entry is aligned with the last bar.
pub fn adx_series(bars: &[Bar], period: usize) -> Vec<f64> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return Vec::new();
    }

    let inputs = directional_inputs(bars);
    let p = period as f64;

    // Wilder-smoothed running sums of TR / +DM / -DM.
    let mut tr_s: f64 = inputs.true_ranges[..period].iter().sum();
    let mut plus_s: f64 = inputs.plus_dms[..period].iter().sum();
    let mut minus_s: f64 = inputs.minus_dms[..period].iter().sum();

    let dx_at = |tr_s: f64, plus_s: f64, minus_s: f64| -> f64 {
        if tr_s <= 0.0 {
            return 0.0;
        }
        let plus_di = plus_s / tr_s * 100.0;
        let minus_di = minus_s / tr_s * 100.0;
        let di_sum = plus_di + minus_di;
        if di_sum > 0.0 {
            (plus_di - minus_di).abs() / di_sum * 100.0
        } else {
            0.0
        }
    };

    let mut dx_values = vec![dx_at(tr_s, plus_s, minus_s)];
    for i in period..inputs.true_ranges.len() {
        tr_s = tr_s - tr_s / p + inputs.true_ranges[i];
        plus_s = plus_s - plus_s / p + inputs.plus_dms[i];
        minus_s = minus_s - minus_s / p + inputs.minus_dms[i];
        dx_values.push(dx_at(tr_s, plus_s, minus_s));
    }

    // ADX is the Wilder-smoothed DX.
    let mut adx: f64 = dx_values[..period].iter().sum::<f64>() / p;
    let mut out = vec![adx];
    for dx in &dx_values[period..] {
        adx = (adx * (p - 1.0) + dx) / p;
        out.push(adx);
    }
    out
}

/// Latest (ADX, +DI, -DI) triple, or None if there is not enough history.
pub fn calculate_adx(bars: &[Bar], period: usize) -> Option<(f64, f64, f64)> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }

    let inputs = directional_inputs(bars);
    let p = period as f64;

    let mut tr_s: f64 = inputs.true_ranges[..period].iter().sum();
    let mut plus_s: f64 = inputs.plus_dms[..period].iter().sum();
    let mut minus_s: f64 = inputs.minus_dms[..period].iter().sum();
    for i in period..inputs.true_ranges.len() {
        tr_s = tr_s - tr_s / p + inputs.true_ranges[i];
        plus_s = plus_s - plus_s / p + inputs.plus_dms[i];
        minus_s = minus_s - minus_s / p + inputs.minus_dms[i];
    }

    let (plus_di, minus_di) = if tr_s > 0.0 {
        (plus_s / tr_s * 100.0, minus_s / tr_s * 100.0)
    } else {
        (0.0, 0.0)
    };

    let adx = *adx_series(bars, period).last()?;
    Some((adx, plus_di, minus_di))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_bars;

    fn trending_up(n: usize) -> Vec<(f64, f64, f64, f64)> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                (base, base + 3.0, base - 1.0, base + 2.0)
            })
            .collect()
    }

    fn flat(n: usize) -> Vec<(f64, f64, f64, f64)> {
        (0..n)
            .map(|i| {
                // Alternate small up/down bars with no net direction.
                let wiggle = if i % 2 == 0 { 0.5 } else { -0.5 };
                (100.0, 101.0 + wiggle, 99.0 - wiggle, 100.0 + wiggle)
            })
            .collect()
    }

    #[test]
    fn test_uptrend_has_strong_adx_and_positive_di() {
        let bars = test_bars(&trending_up(60));
        let (adx, plus_di, minus_di) = calculate_adx(&bars, 14).unwrap();
        assert!(adx > 50.0, "adx={adx}");
        assert!(plus_di > minus_di);
    }

    #[test]
    fn test_flat_market_has_weak_adx() {
        let bars = test_bars(&flat(60));
        let (adx, _, _) = calculate_adx(&bars, 14).unwrap();
        assert!(adx < 25.0, "adx={adx}");
    }

    #[test]
    fn test_series_matches_latest() {
        let bars = test_bars(&trending_up(60));
        let series = adx_series(&bars, 14);
        let (adx, _, _) = calculate_adx(&bars, 14).unwrap();
        assert!((series.last().unwrap() - adx).abs() < 1e-9);
        assert_eq!(series.len(), 60 - 2 * 14 + 1);
    }

    #[test]
    fn test_insufficient_data() {
        let bars = test_bars(&trending_up(20));
        assert!(calculate_adx(&bars, 14).is_none());
        assert!(adx_series(&bars, 14).is_empty());
    }
}
