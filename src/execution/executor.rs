use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::Notifier;
use crate::db::TradeLedger;
use crate::exchange::{
    ExchangeError, ExchangeGateway, OrderOptions, OrderType, PlacedOrder,
};
use crate::models::{EntrySignal, ExchangePosition, Regime, Trade};
use crate::risk::{RiskEngine, SizingInputs};

use super::ProtectionLeases;

const MAX_RETRIES: u32 = 3;

/// Turns approved entry signals into positions.
///
/// Order of operations per entry: margin mode and leverage (cached per
/// symbol), market entry, stop-loss, take-profit, then the ledger row and
/// the operator alert. A protective order that fails after retries is left
/// to the reconciliation loop; the entry is never rolled back.
pub struct Executor {
    gateway: Arc<dyn ExchangeGateway>,
    ledger: Arc<dyn TradeLedger>,
    notifier: Arc<dyn Notifier>,
    risk: Arc<RiskEngine>,
    leases: Arc<ProtectionLeases>,
    margin_mode: String,
    leverage: u32,
    retry_base_delay: Duration,
    leverage_set: Mutex<HashSet<String>>,
    margin_mode_set: Mutex<HashSet<String>>,
}

impl Executor {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        ledger: Arc<dyn TradeLedger>,
        notifier: Arc<dyn Notifier>,
        risk: Arc<RiskEngine>,
        leases: Arc<ProtectionLeases>,
        margin_mode: String,
        leverage: f64,
    ) -> Self {
        Self {
            gateway,
            ledger,
            notifier,
            risk,
            leases,
            margin_mode: margin_mode.to_uppercase(),
            leverage: leverage.max(1.0) as u32,
            retry_base_delay: Duration::from_secs(1),
            leverage_set: Mutex::new(HashSet::new()),
            margin_mode_set: Mutex::new(HashSet::new()),
        }
    }

    #[cfg(test)]
    fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Execute one entry signal end to end. Returns the new trade's ledger
    /// id, or None when the signal was rejected or the entry failed.
    pub async fn execute_signal(
        &self,
        signal: &EntrySignal,
        equity: f64,
        positions: &[ExchangePosition],
        regime: Regime,
    ) -> Option<Uuid> {
        let symbol = &signal.symbol;

        if positions.iter().any(|p| &p.symbol == symbol) {
            info!("[{}] Already holding a position, skipping signal", symbol);
            return None;
        }

        if !self.risk.check_new_trade_allowed(positions) {
            return None;
        }

        // Hard safety: never open a position whose protective levels sit on
        // the wrong side of entry.
        if !signal.levels_valid() {
            warn!(
                "[{}] Invalid {} levels: SL={} entry={} TP={}. Aborting.",
                symbol, signal.side, signal.stop_loss, signal.entry_price, signal.take_profit
            );
            return None;
        }

        let available_margin = match self.gateway.get_balance().await {
            Ok(balance) => Some(balance.available_margin),
            Err(e) => {
                warn!("[{}] Could not fetch available margin: {}", symbol, e);
                None
            }
        };

        let size = self.risk.calculate_position_size(
            equity,
            signal.entry_price,
            SizingInputs {
                stop_loss: Some(signal.stop_loss),
                confidence: Some(signal.confidence),
                atr: signal.atr,
            },
            available_margin,
        );
        if size <= 0.0 {
            warn!("[{}] Position size is zero, aborting", symbol);
            return None;
        }

        info!(
            "⚡ EXECUTING [{}] {} size={:.4} @ {:.4} SL={:.4} TP={:.4}",
            symbol, signal.side, size, signal.entry_price, signal.stop_loss, signal.take_profit
        );

        if let Err(e) = self.ensure_symbol_settings(symbol).await {
            // Both calls are best-effort; the exchange rejects the entry
            // later if settings are genuinely wrong.
            warn!("[{}] Could not apply symbol settings: {}", symbol, e);
        }

        // Lease first: reconciliation must not heal this symbol while the
        // protective orders below are still in flight.
        self.leases.grant(symbol);

        let entry = match self
            .place_with_retry(
                symbol,
                OrderType::Market,
                signal.side,
                size,
                None,
                OrderOptions::default(),
            )
            .await
        {
            Ok(order) => order,
            Err(e) => {
                error!("[{}] Entry order failed after retries: {}", symbol, e);
                self.leases.release(symbol);
                self.report_failure(symbol, &format!("entry order failed: {e}"))
                    .await;
                return None;
            }
        };

        let filled_price = if entry.average_price > 0.0 {
            entry.average_price
        } else {
            signal.entry_price
        };
        let closing = signal.side.closing_side();

        let sl_result = self
            .place_with_retry(
                symbol,
                OrderType::StopMarket,
                closing,
                size,
                None,
                OrderOptions {
                    stop_price: Some(signal.stop_loss),
                    reduce_only: true,
                },
            )
            .await;
        match &sl_result {
            Ok(order) => info!("[{}] SL order placed: {}", symbol, order.id),
            Err(e) => {
                error!(
                    "[{}] Failed to place SL at {} ({}); reconciliation will heal",
                    symbol, signal.stop_loss, e
                );
                self.report_failure(symbol, &format!("stop-loss placement failed: {e}"))
                    .await;
            }
        }

        let tp_result = self
            .place_with_retry(
                symbol,
                OrderType::TakeProfitMarket,
                closing,
                size,
                None,
                OrderOptions {
                    stop_price: Some(signal.take_profit),
                    reduce_only: true,
                },
            )
            .await;
        match &tp_result {
            Ok(order) => info!("[{}] TP order placed: {}", symbol, order.id),
            Err(e) => {
                error!(
                    "[{}] Failed to place TP at {} ({}); reconciliation will heal",
                    symbol, signal.take_profit, e
                );
                self.report_failure(symbol, &format!("take-profit placement failed: {e}"))
                    .await;
            }
        }

        // Placement settled either way; from here the reconciliation loop
        // owns any missing protection.
        self.leases.release(symbol);

        let trade = Trade {
            id: Uuid::new_v4(),
            symbol: symbol.clone(),
            strategy: signal.reason.clone(),
            side: signal.side,
            entry_price: filled_price,
            exit_price: None,
            size,
            sl_price: signal.stop_loss,
            tp_price: signal.take_profit,
            fee: None,
            pnl: None,
            entry_time: Utc::now(),
            exit_time: None,
            exit_reason: None,
            regime_at_entry: regime,
        };
        if let Err(e) = self.ledger.insert_trade(&trade).await {
            error!("[{}] Failed to record trade in ledger: {}", symbol, e);
        }

        self.notifier
            .trade_opened(
                symbol,
                signal.side,
                size,
                filled_price,
                signal.stop_loss,
                signal.take_profit,
            )
            .await;

        info!("✅ Execution complete for {} (entry {})", symbol, entry.id);
        Some(trade.id)
    }

    /// Margin mode and leverage, applied once per symbol per process.
    async fn ensure_symbol_settings(&self, symbol: &str) -> Result<(), ExchangeError> {
        let needs_margin_mode = self
            .margin_mode_set
            .lock()
            .map(|set| !set.contains(symbol))
            .unwrap_or(false);
        if needs_margin_mode {
            self.gateway
                .set_margin_mode(symbol, &self.margin_mode)
                .await?;
            if let Ok(mut set) = self.margin_mode_set.lock() {
                set.insert(symbol.to_string());
            }
        }

        let needs_leverage = self
            .leverage_set
            .lock()
            .map(|set| !set.contains(symbol))
            .unwrap_or(false);
        if needs_leverage {
            self.gateway.set_leverage(symbol, self.leverage).await?;
            if let Ok(mut set) = self.leverage_set.lock() {
                set.insert(symbol.to_string());
            }
        }
        Ok(())
    }

    async fn place_with_retry(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: crate::models::Side,
        amount: f64,
        price: Option<f64>,
        opts: OrderOptions,
    ) -> Result<PlacedOrder, ExchangeError> {
        let mut last_error = None;
        for attempt in 0..MAX_RETRIES {
            match self
                .gateway
                .create_order(symbol, order_type, side, amount, price, opts)
                .await
            {
                Ok(order) => return Ok(order),
                Err(e) => {
                    let delay = self.retry_base_delay * 2u32.pow(attempt);
                    warn!(
                        "[{}] {} attempt {}/{} failed ({}), retrying in {:?}",
                        symbol,
                        order_type.as_str(),
                        attempt + 1,
                        MAX_RETRIES,
                        e,
                        delay
                    );
                    last_error = Some(e);
                    if attempt + 1 < MAX_RETRIES {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or(ExchangeError::Transport("retries exhausted".to_string())))
    }

    async fn report_failure(&self, symbol: &str, message: &str) {
        if let Err(e) = self
            .ledger
            .record_component_error("executor", &format!("[{symbol}] {message}"))
            .await
        {
            error!("Failed to record executor error: {}", e);
        }
        self.notifier
            .component_error("executor", &format!("{symbol}: {message}"))
            .await;
    }
}
