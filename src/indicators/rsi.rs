//! Relative Strength Index with Wilder smoothing.

/// Latest RSI value, or None if there is not enough history.
pub fn calculate_rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }

    let mut gains = Vec::with_capacity(values.len() - 1);
    let mut losses = Vec::with_capacity(values.len() - 1);
    for pair in values.windows(2) {
        let change = pair[1] - pair[0];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }

    let p = period as f64;
    let mut avg_gain: f64 = gains[..period].iter().sum::<f64>() / p;
    let mut avg_loss: f64 = losses[..period].iter().sum::<f64>() / p;
    for i in period..gains.len() {
        avg_gain = (avg_gain * (p - 1.0) + gains[i]) / p;
        avg_loss = (avg_loss * (p - 1.0) + losses[i]) / p;
    }

    if avg_loss < f64::EPSILON {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_gains_is_max() {
        let values: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert!((calculate_rsi(&values, 14).unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_all_losses_is_min() {
        let values: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert!(calculate_rsi(&values, 14).unwrap() < 1e-9);
    }

    #[test]
    fn test_balanced_moves_are_neutral() {
        let values: Vec<f64> = (0..30)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let rsi = calculate_rsi(&values, 14).unwrap();
        assert!(rsi > 40.0 && rsi < 60.0, "rsi={rsi}");
    }

    #[test]
    fn test_insufficient_data() {
        assert!(calculate_rsi(&[100.0, 101.0], 14).is_none());
    }
}
