use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::alerts::Notifier;
use crate::config::MonitoringConfig;
use crate::db::TradeLedger;
use crate::exchange::ExchangeGateway;
use crate::models::{ExitReason, Side, Trade, TradeExit};

/// Taker fee rate used when the exchange fill history is unavailable.
const FALLBACK_FEE_RATE: f64 = 0.0004;

/// Fraction of the trade size that must be covered by accumulated fills
/// before the VWAP is trusted as the exit price.
const FILL_COVERAGE: f64 = 0.99;

/// Detects positions that vanished from the exchange (stop hit, target hit,
/// manual close, liquidation) and settles the matching ledger row.
pub struct PositionMonitor {
    cfg: MonitoringConfig,
    gateway: Arc<dyn ExchangeGateway>,
    ledger: Arc<dyn TradeLedger>,
    notifier: Arc<dyn Notifier>,
    known: Mutex<HashSet<String>>,
    running: AtomicBool,
}

impl PositionMonitor {
    pub fn new(
        cfg: MonitoringConfig,
        gateway: Arc<dyn ExchangeGateway>,
        ledger: Arc<dyn TradeLedger>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            cfg,
            gateway,
            ledger,
            notifier,
            known: Mutex::new(HashSet::new()),
            running: AtomicBool::new(true),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn run(&self) {
        info!(
            "👁️ Starting position monitor (interval {}s)",
            self.cfg.position_check_interval_seconds
        );

        // Seed the baseline so positions open before startup are tracked
        // rather than treated as closures.
        match self.gateway.fetch_positions().await {
            Ok(positions) => {
                if let Ok(mut known) = self.known.lock() {
                    *known = positions
                        .iter()
                        .filter(|p| p.size != 0.0)
                        .map(|p| p.symbol.clone())
                        .collect();
                }
            }
            Err(e) => error!("Position monitor failed initial snapshot: {}", e),
        }

        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(
                self.cfg.position_check_interval_seconds,
            ))
            .await;
            if let Err(e) = self.check_once().await {
                error!("Position monitor cycle failed: {}", e);
                self.notifier
                    .component_error("position_monitor", &e.to_string())
                    .await;
            }
        }
        info!("Position monitor stopped");
    }

    /// One detection pass. Returns the symbols settled this pass.
    pub async fn check_once(&self) -> crate::Result<Vec<String>> {
        let positions = self.gateway.fetch_positions().await?;
        let current: HashSet<String> = positions
            .iter()
            .filter(|p| p.size != 0.0)
            .map(|p| p.symbol.clone())
            .collect();

        let closed: Vec<String> = {
            let Ok(mut known) = self.known.lock() else {
                return Err("position monitor state poisoned".into());
            };
            let gone = known.difference(&current).cloned().collect();
            *known = current;
            gone
        };

        for symbol in &closed {
            info!("🔔 Position closed on exchange: {}", symbol);
            if let Err(e) = self.settle(symbol).await {
                error!("[{}] Failed to settle closed position: {}", symbol, e);
                self.ledger
                    .record_component_error("position_monitor", &format!("[{symbol}] {e}"))
                    .await
                    .ok();
            }
        }

        Ok(closed)
    }

    async fn settle(&self, symbol: &str) -> crate::Result<()> {
        let Some(trade) = self.ledger.latest_open_trade(symbol).await? else {
            warn!("[{}] Closed position has no open ledger row", symbol);
            return Ok(());
        };

        let (exit_price, fee, order_type) = self.exit_details(&trade).await;
        let reason = classify_exit_reason(
            trade.side,
            trade.sl_price,
            trade.tp_price,
            exit_price,
            order_type.as_deref(),
            self.cfg.exit_price_tolerance_pct,
        );
        let pnl = match trade.side {
            Side::Buy => (exit_price - trade.entry_price) * trade.size,
            Side::Sell => (trade.entry_price - exit_price) * trade.size,
        };

        let exit = TradeExit {
            exit_price,
            fee,
            pnl,
            exit_time: Utc::now(),
            exit_reason: reason,
        };
        self.ledger.close_trade(trade.id, &exit).await?;

        info!(
            "💰 {} {} closed: exit {:.4}, pnl {:.2}, reason {}",
            symbol,
            trade.side,
            exit_price,
            pnl,
            reason.as_str()
        );
        self.notifier
            .trade_closed(symbol, trade.side, pnl, reason)
            .await;
        Ok(())
    }

    /// Exit price, fee, and (best-effort) closing order type.
    ///
    /// Preferred source is the user fill history: newest fills are summed
    /// until they cover the trade size, giving a volume-weighted exit price
    /// and the exact fees paid. If that fails, the last 1m close stands in
    /// and the fee is estimated at the taker rate.
    async fn exit_details(&self, trade: &Trade) -> (f64, f64, Option<String>) {
        match self.gateway.fetch_user_trades(&trade.symbol, 20).await {
            Ok(mut fills) if !fills.is_empty() => {
                fills.sort_by(|a, b| b.time.cmp(&a.time));

                let mut qty = 0.0;
                let mut notional = 0.0;
                let mut fee = 0.0;
                let mut last_order_id = None;
                for fill in &fills {
                    qty += fill.qty;
                    notional += fill.qty * fill.price;
                    fee += fill.fee;
                    last_order_id = Some(fill.order_id.clone());
                    if qty >= trade.size * FILL_COVERAGE {
                        break;
                    }
                }

                if qty >= trade.size * FILL_COVERAGE && qty > 0.0 {
                    let order_type = match last_order_id {
                        Some(id) => self
                            .gateway
                            .fetch_order(&trade.symbol, &id)
                            .await
                            .ok()
                            .map(|o| o.order_type),
                        None => None,
                    };
                    return (notional / qty, fee, order_type);
                }
                warn!(
                    "[{}] Fill history covers {:.6} of {:.6}, using price fallback",
                    trade.symbol, qty, trade.size
                );
                self.fallback_exit(trade).await
            }
            Ok(_) => self.fallback_exit(trade).await,
            Err(e) => {
                warn!("[{}] Failed to fetch fills: {}", trade.symbol, e);
                self.fallback_exit(trade).await
            }
        }
    }

    async fn fallback_exit(&self, trade: &Trade) -> (f64, f64, Option<String>) {
        let price = match self.gateway.fetch_ohlcv(&trade.symbol, "1m", 1).await {
            Ok(bars) => bars.last().map(|b| b.close).unwrap_or(0.0),
            Err(e) => {
                error!("[{}] Price fallback failed: {}", trade.symbol, e);
                0.0
            }
        };
        (price, trade.size * price * FALLBACK_FEE_RATE, None)
    }
}

/// Map a closure to an exit reason.
///
/// The closing order's type is decisive when known; otherwise the exit price
/// is compared against the stop and target within a tolerance band. Anything
/// unattributable is MANUAL.
pub(crate) fn classify_exit_reason(
    side: Side,
    sl_price: f64,
    tp_price: f64,
    exit_price: f64,
    order_type: Option<&str>,
    tolerance_pct: f64,
) -> ExitReason {
    if let Some(t) = order_type {
        let t = t.to_uppercase();
        if t.contains("TAKE_PROFIT") {
            return ExitReason::TpHit;
        }
        if t.contains("STOP") {
            return ExitReason::SlHit;
        }
        // Plain MARKET or LIMIT closes fall through to price inference.
    }

    if exit_price <= 0.0 {
        return ExitReason::Manual;
    }

    let tolerance = exit_price * tolerance_pct;
    match side {
        Side::Buy => {
            if exit_price >= tp_price - tolerance {
                ExitReason::TpHit
            } else if exit_price <= sl_price + tolerance {
                ExitReason::SlHit
            } else {
                ExitReason::Manual
            }
        }
        Side::Sell => {
            if exit_price <= tp_price + tolerance {
                ExitReason::TpHit
            } else if exit_price >= sl_price - tolerance {
                ExitReason::SlHit
            } else {
                ExitReason::Manual
            }
        }
    }
}
