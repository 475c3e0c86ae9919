//! Average True Range: volatility via Wilder-smoothed true ranges.

use crate::models::Bar;

fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    let mut out = Vec::with_capacity(bars.len().saturating_sub(1));
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;
        out.push(
            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs()),
        );
    }
    out
}

/// Latest ATR value, or None if there is not enough history.
pub fn calculate_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let trs = true_ranges(bars);

    // Seed with a simple average, then apply Wilder's smoothing.
    let mut atr: f64 = trs.iter().take(period).sum::<f64>() / period as f64;
    for tr in &trs[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
    }

    Some(atr)
}
