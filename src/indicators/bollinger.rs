//! Bollinger bands and normalized bandwidth.

/// Band levels at a single point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl BollingerBands {
    /// Normalized width: (upper - lower) / middle.
    pub fn width(&self) -> f64 {
        if self.middle.abs() < f64::EPSILON {
            0.0
        } else {
            (self.upper - self.lower) / self.middle
        }
    }
}

fn bands_at(window: &[f64], std_devs: f64) -> BollingerBands {
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let sd = variance.sqrt();
    BollingerBands {
        upper: mean + std_devs * sd,
        middle: mean,
        lower: mean - std_devs * sd,
    }
}

/// Latest bands, or None if there is not enough history.
pub fn calculate_bollinger(values: &[f64], period: usize, std_devs: f64) -> Option<BollingerBands> {
    if period == 0 || values.len() < period {
        return None;
    }
    Some(bands_at(&values[values.len() - period..], std_devs))
}

/// Bandwidth series, newest last.
///
/// Entry `k` corresponds to input index `period - 1 + k`.
pub fn bandwidth_series(values: &[f64], period: usize, std_devs: f64) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    values
        .windows(period)
        .map(|w| bands_at(w, std_devs).width())
        .collect()
}
