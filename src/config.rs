use serde::Deserialize;

use crate::Result;

/// Static configuration loaded once at startup.
///
/// Layered from a TOML file plus `PERPBOT__*` environment overrides; secrets
/// (API keys, Telegram credentials) come from the environment only.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub symbols: Vec<String>,
    pub timeframe: String,
    /// Seconds between trading cycles.
    pub cycle_seconds: u64,
    /// History fetched per symbol before streaming begins.
    pub preload_bars: usize,
    /// Ring buffer capacity per (symbol, timeframe).
    pub max_cached_bars: usize,
    pub risk: RiskConfig,
    pub regime: RegimeConfig,
    pub strategies: StrategiesConfig,
    pub reconciliation: ReconciliationConfig,
    pub monitoring: MonitoringConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            timeframe: "1h".to_string(),
            cycle_seconds: 60,
            preload_bars: 500,
            max_cached_bars: 500,
            risk: RiskConfig::default(),
            regime: RegimeConfig::default(),
            strategies: StrategiesConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            monitoring: MonitoringConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Equity fraction lost if the stop is hit (flat sizing mode).
    pub target_risk_pct: f64,
    pub max_open_positions: usize,
    pub leverage: f64,
    /// Daily drawdown fraction that trips the kill-switch.
    pub max_daily_drawdown_pct: f64,
    /// Max margin per position as a fraction of equity.
    pub max_position_pct: f64,
    pub margin_mode: String,
    pub use_confidence_sizing: bool,
    pub min_risk_pct: f64,
    pub max_risk_pct: f64,
    pub min_confidence_threshold: f64,
    /// "linear" or "squared".
    pub confidence_curve: String,
    /// Reject stops wider than this many ATRs.
    pub max_stop_atr_mult: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            target_risk_pct: 0.005,
            max_open_positions: 3,
            leverage: 2.0,
            max_daily_drawdown_pct: 0.05,
            max_position_pct: 0.25,
            margin_mode: "ISOLATED".to_string(),
            use_confidence_sizing: false,
            min_risk_pct: 0.0025,
            max_risk_pct: 0.0075,
            min_confidence_threshold: 0.20,
            confidence_curve: "squared".to_string(),
            max_stop_atr_mult: 1.8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Trailing window for rolling quantile thresholds.
    pub quantile_window: usize,
    /// Consecutive proposals required before a regime flip is confirmed.
    pub min_duration_bars: u32,
    /// Minimum |EMA separation| (percent) for a trend label.
    pub ema_sep_min: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            quantile_window: 200,
            min_duration_bars: 3,
            ema_sep_min: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
    pub trend_pullback: TrendPullbackConfig,
    pub range_mean_reversion: RangeMeanRevConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrendPullbackConfig {
    pub enabled: bool,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    /// Reward multiple applied to stop distance for the target.
    pub reward_ratio: f64,
}

impl Default for TrendPullbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            reward_ratio: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RangeMeanRevConfig {
    pub enabled: bool,
    pub rsi_long_max: f64,
    pub rsi_short_min: f64,
    /// ATR multiple used for the stop buffer beyond structure.
    pub atr_mult: f64,
    /// Minimum stop distance as a fraction of price.
    pub min_sl_pct: f64,
    /// Reject signals whose stop distance exceeds this fraction of price.
    pub max_sl_pct: f64,
}

impl Default for RangeMeanRevConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rsi_long_max: 40.0,
            rsi_short_min: 60.0,
            atr_mult: 1.5,
            min_sl_pct: 0.012,
            max_sl_pct: 0.05,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub interval_seconds: u64,
    pub auto_add_sl: bool,
    pub auto_add_tp: bool,
    pub atr_sl_multiplier: f64,
    pub atr_tp_multiplier: f64,
    /// Seconds after order placement during which reconciliation must not
    /// heal the symbol (the orchestrator's own protective orders may still
    /// be in flight).
    pub protection_lease_seconds: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 180,
            auto_add_sl: true,
            auto_add_tp: true,
            atr_sl_multiplier: 2.0,
            atr_tp_multiplier: 3.0,
            protection_lease_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub position_check_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    /// Price proximity band for exit-reason classification, as a fraction of
    /// exit price.
    pub exit_price_tolerance_pct: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            position_check_interval_seconds: 120,
            heartbeat_interval_seconds: 3600,
            exit_price_tolerance_pct: 0.005,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub close_positions: bool,
    pub cancel_orders: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            close_positions: true,
            cancel_orders: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file (optional) layered with
    /// `PERPBOT__`-prefixed environment variables.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("PERPBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err("config: at least one symbol is required".into());
        }
        if self.risk.leverage < 1.0 {
            return Err("config: leverage must be >= 1".into());
        }
        if self.risk.target_risk_pct > 0.02 {
            // Fat-finger guard from the risk policy: >2% per trade is
            // almost certainly a misconfiguration.
            return Err("config: target_risk_pct above 0.02 is not allowed".into());
        }
        if self.regime.min_duration_bars == 0 {
            return Err("config: min_duration_bars must be >= 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.regime.min_duration_bars, 3);
        assert_eq!(cfg.reconciliation.interval_seconds, 180);
        assert!((cfg.monitoring.exit_price_tolerance_pct - 0.005).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_excessive_risk() {
        let mut cfg = Config::default();
        cfg.risk.target_risk_pct = 0.05;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_sub_unit_leverage() {
        let mut cfg = Config::default();
        cfg.risk.leverage = 0.5;
        assert!(cfg.validate().is_err());
    }
}
