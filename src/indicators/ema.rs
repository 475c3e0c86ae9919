//! Exponential moving averages, SMA-seeded.

/// EMA series over `values`, newest last.
///
/// Entry `k` corresponds to input index `period - 1 + k`; the last entry is
/// aligned with the last input value. Empty if there is not enough history.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);

    let mut ema: f64 = values[..period].iter().sum::<f64>() / period as f64;
    let mut out = vec![ema];
    for v in &values[period..] {
        ema = alpha * v + (1.0 - alpha) * ema;
        out.push(ema);
    }
    out
}

/// Latest EMA value, or None if there is not enough history.
pub fn calculate_ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

/// Value `back` bars before the end of a bar-aligned series
/// (`back == 0` is the latest entry).
pub fn at_offset(series: &[f64], back: usize) -> Option<f64> {
    if series.len() > back {
        Some(series[series.len() - 1 - back])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_series() {
        let values = vec![50.0; 30];
        let ema = calculate_ema(&values, 20).unwrap();
        assert!((ema - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_tracks_rising_prices() {
        let values: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let fast = calculate_ema(&values, 20).unwrap();
        let slow = calculate_ema(&values, 50).unwrap();
        // Faster EMA hugs the rising price more closely.
        assert!(fast > slow);
        assert!(fast < *values.last().unwrap());
    }

    #[test]
    fn test_series_alignment() {
        let values: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let series = ema_series(&values, 20);
        assert_eq!(series.len(), 30 - 20 + 1);
        assert_eq!(at_offset(&series, 0), series.last().copied());
        assert!(at_offset(&series, series.len()).is_none());
    }

    #[test]
    fn test_insufficient_data() {
        assert!(ema_series(&[1.0, 2.0], 20).is_empty());
        assert!(calculate_ema(&[1.0, 2.0], 20).is_none());
    }
}
