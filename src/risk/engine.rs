use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::models::ExchangePosition;

use super::KillSwitch;

/// Per-trade inputs to position sizing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizingInputs {
    pub stop_loss: Option<f64>,
    pub confidence: Option<f64>,
    pub atr: Option<f64>,
}

/// Stop-distance position sizing plus the portfolio guardrails: position
/// count cap, margin caps, and the daily-drawdown kill-switch.
pub struct RiskEngine {
    cfg: RiskConfig,
    kill_switch: Arc<KillSwitch>,
}

impl RiskEngine {
    pub fn new(mut cfg: RiskConfig, kill_switch: Arc<KillSwitch>) -> Self {
        if cfg.target_risk_pct > 0.02 {
            warn!(
                "target_risk_pct={:.3} is very high; capping to 0.02",
                cfg.target_risk_pct
            );
            cfg.target_risk_pct = 0.02;
        }
        if cfg.leverage < 1.0 {
            cfg.leverage = 1.0;
        }
        Self { cfg, kill_switch }
    }

    pub fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.kill_switch
    }

    /// Compare current equity against the day's starting equity. Returns
    /// false and trips the kill-switch when the drawdown limit is breached.
    pub fn check_daily_drawdown(&self, start_equity: f64, current_equity: f64) -> bool {
        if start_equity <= 0.0 {
            warn!("Start equity is zero or negative, cannot compute drawdown");
            return true;
        }

        let drawdown = ((start_equity - current_equity) / start_equity).max(0.0);
        if drawdown > 0.0 {
            info!(
                "📉 Daily drawdown: {:.2}% (limit {:.1}%)",
                drawdown * 100.0,
                self.cfg.max_daily_drawdown_pct * 100.0
            );
        }

        if drawdown >= self.cfg.max_daily_drawdown_pct {
            self.kill_switch.activate(&format!(
                "daily drawdown limit breached: {:.2}% >= {:.1}%",
                drawdown * 100.0,
                self.cfg.max_daily_drawdown_pct * 100.0
            ));
            return false;
        }
        true
    }

    /// Gate for new entries: kill-switch and open-position cap.
    pub fn check_new_trade_allowed(&self, positions: &[ExchangePosition]) -> bool {
        if self.kill_switch.is_active() {
            info!("Trade rejected: kill-switch active");
            return false;
        }
        if positions.len() >= self.cfg.max_open_positions {
            info!(
                "Trade rejected: max open positions reached ({})",
                self.cfg.max_open_positions
            );
            return false;
        }
        true
    }

    /// Risk fraction for this trade, optionally throttled by signal
    /// confidence. Zero means reject.
    fn effective_risk_pct(&self, confidence: Option<f64>) -> f64 {
        let base = self.cfg.target_risk_pct;
        if !self.cfg.use_confidence_sizing {
            return base;
        }
        let Some(conf) = confidence else {
            return base;
        };

        if conf < self.cfg.min_confidence_threshold {
            return 0.0;
        }

        let span = self.cfg.max_risk_pct - self.cfg.min_risk_pct;
        let scaled = if self.cfg.confidence_curve == "linear" {
            self.cfg.min_risk_pct + span * conf
        } else {
            self.cfg.min_risk_pct + span * conf * conf
        };
        scaled.clamp(self.cfg.min_risk_pct, self.cfg.max_risk_pct)
    }

    /// Position size in base units, or 0.0 when the trade must be rejected.
    ///
    /// size = equity * risk_pct / |entry - stop|, then capped so margin
    /// never exceeds `max_position_pct` of equity nor 90% of available
    /// margin.
    pub fn calculate_position_size(
        &self,
        equity: f64,
        entry_price: f64,
        inputs: SizingInputs,
        available_margin: Option<f64>,
    ) -> f64 {
        let Some(stop_loss) = inputs.stop_loss else {
            warn!("No stop loss provided, cannot size position");
            return 0.0;
        };

        let stop_dist = (entry_price - stop_loss).abs();
        if stop_dist <= 0.0 || entry_price <= 0.0 {
            warn!("Stop distance is zero or negative, cannot size position");
            return 0.0;
        }

        if let Some(atr) = inputs.atr {
            if atr > 0.0 && stop_dist > self.cfg.max_stop_atr_mult * atr {
                info!(
                    "Trade rejected: stop_dist={:.6} > {:.2}*ATR({:.6})",
                    stop_dist, self.cfg.max_stop_atr_mult, atr
                );
                return 0.0;
            }
        }

        let risk_pct = self.effective_risk_pct(inputs.confidence);
        if risk_pct <= 0.0 {
            info!(
                "Trade rejected: confidence {:?} below threshold",
                inputs.confidence
            );
            return 0.0;
        }

        let risk_amount = equity * risk_pct;
        let mut size = risk_amount / stop_dist;

        let mut margin_used = size * entry_price / self.cfg.leverage;

        // Cap 1: margin per position as a fraction of equity.
        let max_margin = equity * self.cfg.max_position_pct;
        if margin_used > max_margin {
            let max_notional = max_margin * self.cfg.leverage;
            info!(
                "Margin ${:.2} exceeds cap ${:.2}, capping notional to ${:.2}",
                margin_used, max_margin, max_notional
            );
            size = max_notional / entry_price;
            margin_used = size * entry_price / self.cfg.leverage;
        }

        // Cap 2: leave a 10% buffer of whatever margin is actually free.
        if let Some(available) = available_margin {
            let usable = available * 0.90;
            if margin_used > usable {
                if usable <= 0.0 {
                    warn!(
                        "No available margin (available=${:.2}), cannot open position",
                        available
                    );
                    return 0.0;
                }
                info!(
                    "Margin ${:.2} exceeds usable ${:.2} (90% of ${:.2}), reducing",
                    margin_used, usable, available
                );
                size = usable * self.cfg.leverage / entry_price;
            }
        }

        if size <= 0.0 || !size.is_finite() {
            return 0.0;
        }
        size
    }
}
