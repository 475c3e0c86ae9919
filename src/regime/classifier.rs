use std::collections::HashMap;

use tracing::debug;

use crate::config::RegimeConfig;
use crate::indicators::FeatureSeries;
use crate::models::{Regime, RegimeFeatures, RegimeResult};

const MIN_BARS: usize = 50;
const EPS: f64 = 1e-9;

/// Debounce state for one symbol. A proposed regime must repeat for
/// `min_duration_bars` consecutive classifications before it is confirmed.
#[derive(Debug, Clone)]
struct HysteresisState {
    confirmed: Regime,
    pending: Option<Regime>,
    pending_count: u32,
}

impl Default for HysteresisState {
    fn default() -> Self {
        Self {
            confirmed: Regime::NoTrade,
            pending: None,
            pending_count: 0,
        }
    }
}

impl HysteresisState {
    fn confirm(&mut self, proposed: Regime, min_duration: u32) -> Regime {
        if proposed == self.confirmed {
            self.pending = None;
            self.pending_count = 0;
            return self.confirmed;
        }

        if self.pending != Some(proposed) {
            self.pending = Some(proposed);
            self.pending_count = 1;
            return self.confirmed;
        }

        self.pending_count += 1;
        if self.pending_count >= min_duration {
            self.confirmed = proposed;
            self.pending = None;
            self.pending_count = 0;
        }
        self.confirmed
    }
}

/// Classifies each symbol into a regime from quantile-relative thresholds,
/// then stabilizes the label with hysteresis.
///
/// Thresholds adapt to the instrument: "strong ADX" means strong relative to
/// this symbol's own recent distribution, not an absolute number.
pub struct RegimeClassifier {
    cfg: RegimeConfig,
    states: HashMap<String, HysteresisState>,
}

impl RegimeClassifier {
    pub fn new(cfg: RegimeConfig) -> Self {
        Self {
            cfg,
            states: HashMap::new(),
        }
    }

    /// Classify one symbol from its latest feature snapshot.
    ///
    /// `bars_len` is the number of bars behind the features; below the
    /// warm-up minimum the result is NO_TRADE and hysteresis state is left
    /// untouched.
    pub fn detect_regime(
        &mut self,
        symbol: &str,
        bars_len: usize,
        features: &FeatureSeries,
    ) -> RegimeResult {
        if bars_len < MIN_BARS {
            return RegimeResult {
                symbol: symbol.to_string(),
                confirmed: Regime::NoTrade,
                proposed: Regime::NoTrade,
                confidence: 0.0,
                features: RegimeFeatures::default(),
                reason: "insufficient data".to_string(),
            };
        }

        let window = self.cfg.quantile_window;
        let adx_recent = tail(&features.adx, window);
        let bw_recent = tail(&features.bb_width, window);

        let adx = features.adx_now();
        let bb_width = features.bb_width_now();
        let ema_sep = features.ema_sep;

        let adx_high = quantile(adx_recent, 0.60);
        let adx_low = quantile(adx_recent, 0.40);
        let bw_low = quantile(bw_recent, 0.20);

        let (proposed, confidence, reason) = if adx > adx_high && ema_sep.abs() > self.cfg.ema_sep_min
        {
            let proposed = if ema_sep > 0.0 {
                Regime::TrendBull
            } else {
                Regime::TrendBear
            };
            let adx_max = adx_recent.iter().cloned().fold(f64::MIN, f64::max);
            let confidence = (adx - adx_high) / (adx_max - adx_high).max(EPS);
            (proposed, confidence, "ADX strong + EMA separation")
        } else if bb_width < bw_low {
            let bw_med = quantile(bw_recent, 0.50);
            let confidence = (bw_low - bb_width) / bw_med.max(EPS);
            (Regime::Squeeze, confidence, "BB bandwidth compressed")
        } else if adx < adx_low {
            let confidence = (adx_low - adx) / adx_low.max(EPS);
            (Regime::Range, confidence, "ADX weak (non-trending)")
        } else {
            (Regime::NoTrade, 0.0, "transition zone")
        };

        let state = self.states.entry(symbol.to_string()).or_default();
        let confirmed = state.confirm(proposed, self.cfg.min_duration_bars);

        debug!(
            "🧭 {} regime: confirmed={} proposed={} adx={:.1} bw={:.4} sep={:.2}%",
            symbol, confirmed, proposed, adx, bb_width, ema_sep
        );

        RegimeResult {
            symbol: symbol.to_string(),
            confirmed,
            proposed,
            confidence: confidence.clamp(0.0, 1.0),
            features: RegimeFeatures {
                adx,
                bb_width,
                ema_sep,
                adx_threshold_high: adx_high,
                adx_threshold_low: adx_low,
                bw_threshold_low: bw_low,
                pending_regime: state.pending,
                pending_count: state.pending_count,
            },
            reason: reason.to_string(),
        }
    }
}

fn tail(values: &[f64], window: usize) -> &[f64] {
    if values.len() > window {
        &values[values.len() - window..]
    } else {
        values
    }
}

/// Linearly interpolated quantile over an unsorted sample.
fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = pos - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * frac
    }
}
