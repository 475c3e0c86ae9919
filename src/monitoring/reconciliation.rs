use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::alerts::Notifier;
use crate::config::ReconciliationConfig;
use crate::data::MarketDataCache;
use crate::db::TradeLedger;
use crate::exchange::{ExchangeError, ExchangeGateway, OrderOptions, OrderType};
use crate::execution::ProtectionLeases;
use crate::indicators::{calculate_atr, ATR_PERIOD};
use crate::models::{ExchangeOrder, ExchangePosition, PositionSide};

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub stops_added: usize,
    pub targets_added: usize,
    pub orphans_cancelled: usize,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodically repairs drift between intent and exchange state: every open
/// position must carry reduce-only protection, and no reduce-only order may
/// outlive its position.
///
/// Healing respects the executor's protection leases; orphan cancellation
/// does not, since an orphan is stale no matter who placed it.
pub struct ReconciliationLoop {
    cfg: ReconciliationConfig,
    gateway: Arc<dyn ExchangeGateway>,
    ledger: Arc<dyn TradeLedger>,
    notifier: Arc<dyn Notifier>,
    cache: Arc<MarketDataCache>,
    leases: Arc<ProtectionLeases>,
    timeframe: String,
    running: AtomicBool,
}

impl ReconciliationLoop {
    pub fn new(
        cfg: ReconciliationConfig,
        gateway: Arc<dyn ExchangeGateway>,
        ledger: Arc<dyn TradeLedger>,
        notifier: Arc<dyn Notifier>,
        cache: Arc<MarketDataCache>,
        leases: Arc<ProtectionLeases>,
        timeframe: String,
    ) -> Self {
        Self {
            cfg,
            gateway,
            ledger,
            notifier,
            cache,
            leases,
            timeframe,
            running: AtomicBool::new(true),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn run(&self) {
        info!(
            "🔧 Starting reconciliation loop (interval {}s)",
            self.cfg.interval_seconds
        );
        let mut consecutive_errors: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            match self.run_once().await {
                Ok(report) => {
                    consecutive_errors = 0;
                    if !report.is_clean() {
                        info!(
                            "Reconciliation: {} SL added, {} TP added, {} orphans cancelled",
                            report.stops_added, report.targets_added, report.orphans_cancelled
                        );
                    }
                }
                Err(e) if e.is_rate_limit() => {
                    consecutive_errors += 1;
                    let wait = (self.cfg.interval_seconds * 2u64.saturating_pow(consecutive_errors))
                        .min(300);
                    warn!("Reconciliation backing off {}s after rate limit", wait);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!("Reconciliation error: {}", e);
                    self.notifier
                        .component_error("reconciliation", &e.to_string())
                        .await;
                }
            }
            tokio::time::sleep(Duration::from_secs(self.cfg.interval_seconds)).await;
        }
        info!("Reconciliation loop stopped");
    }

    /// One reconciliation pass. Idempotent: a healthy book produces an empty
    /// report and no exchange mutations.
    pub async fn run_once(&self) -> Result<ReconciliationReport, ExchangeError> {
        let positions = self.gateway.fetch_positions().await?;
        let orders = self.gateway.fetch_open_orders(None).await?;

        let mut orders_by_symbol: HashMap<&str, Vec<&ExchangeOrder>> = HashMap::new();
        for order in &orders {
            orders_by_symbol.entry(&order.symbol).or_default().push(order);
        }

        let mut report = ReconciliationReport::default();

        for position in &positions {
            if position.size == 0.0 {
                continue;
            }
            let symbol_orders = orders_by_symbol
                .get(position.symbol.as_str())
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            let has_stop = symbol_orders.iter().any(|o| o.reduce_only && o.is_stop());
            let has_tp = symbol_orders
                .iter()
                .any(|o| o.reduce_only && o.is_take_profit());

            if has_stop && has_tp {
                continue;
            }

            if self.leases.is_held(&position.symbol) {
                info!(
                    "[{}] Protection lease held, deferring heal",
                    position.symbol
                );
                continue;
            }

            if !has_stop {
                warn!("[{}] Missing stop-loss order", position.symbol);
                if self.cfg.auto_add_sl {
                    if self.heal(position, OrderType::StopMarket).await {
                        report.stops_added += 1;
                    }
                } else {
                    self.alert_only(&position.symbol, "missing SL").await;
                }
            }
            if !has_tp {
                warn!("[{}] Missing take-profit order", position.symbol);
                if self.cfg.auto_add_tp {
                    if self.heal(position, OrderType::TakeProfitMarket).await {
                        report.targets_added += 1;
                    }
                } else {
                    self.alert_only(&position.symbol, "missing TP").await;
                }
            }
        }

        // Reduce-only orders with no position behind them are stale leftovers.
        for (symbol, symbol_orders) in &orders_by_symbol {
            if positions.iter().any(|p| p.symbol == *symbol) {
                continue;
            }
            for order in symbol_orders {
                if !order.reduce_only {
                    continue;
                }
                warn!("[{}] Orphan reduce-only order {}", symbol, order.id);
                match self.gateway.cancel_order(&order.id, symbol).await {
                    Ok(()) => {
                        report.orphans_cancelled += 1;
                        self.record_action(symbol, &format!("orphan order {} cancelled", order.id))
                            .await;
                    }
                    Err(e) => error!("[{}] Failed to cancel orphan order: {}", symbol, e),
                }
            }
        }

        Ok(report)
    }

    /// Place a replacement protective order at an ATR-derived level.
    async fn heal(&self, position: &ExchangePosition, order_type: OrderType) -> bool {
        let symbol = &position.symbol;
        let entry = position.entry_price;

        let bars = self.cache.snapshot(symbol, &self.timeframe);
        let atr = calculate_atr(&bars, ATR_PERIOD).filter(|a| *a > 0.0);

        let (distance, label) = match order_type {
            OrderType::TakeProfitMarket => (
                atr.unwrap_or(entry * 0.03) * self.cfg.atr_tp_multiplier,
                "TP",
            ),
            _ => (
                atr.unwrap_or(entry * 0.02) * self.cfg.atr_sl_multiplier,
                "SL",
            ),
        };

        let price = match (order_type, position.side) {
            (OrderType::TakeProfitMarket, PositionSide::Long) => entry + distance,
            (OrderType::TakeProfitMarket, PositionSide::Short) => entry - distance,
            (_, PositionSide::Long) => entry - distance,
            (_, PositionSide::Short) => entry + distance,
        };
        let side = position.side.closing_side();

        info!(
            "[{}] Healing {} at {:.4} (entry {:.4}, atr {:?})",
            symbol, label, price, entry, atr
        );

        match self
            .gateway
            .create_order(
                symbol,
                order_type,
                side,
                position.size,
                None,
                OrderOptions {
                    stop_price: Some(price),
                    reduce_only: true,
                },
            )
            .await
        {
            Ok(_) => {
                let action = format!("added {} at {:.4} (ATR-based)", label, price);
                self.notifier.reconciliation_action(symbol, &action).await;
                self.record_action(symbol, &action).await;
                true
            }
            Err(e) => {
                error!("[{}] Failed to heal {}: {}", symbol, label, e);
                let action = format!("failed to add {label}: {e}");
                self.notifier.reconciliation_action(symbol, &action).await;
                self.record_action(symbol, &action).await;
                false
            }
        }
    }

    /// Auto-heal is off for this order kind: the operator still hears about
    /// the unprotected position every pass.
    async fn alert_only(&self, symbol: &str, issue: &str) {
        let action = format!("{issue}, alert only (auto-heal disabled)");
        self.notifier.reconciliation_action(symbol, &action).await;
        self.record_action(symbol, &action).await;
    }

    async fn record_action(&self, symbol: &str, action: &str) {
        if let Err(e) = self
            .ledger
            .record_system_event("reconciliation", &format!("[{symbol}] {action}"))
            .await
        {
            error!("Failed to record reconciliation action: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::NullNotifier;
    use crate::exchange::{AccountBalance, FillRecord, PlacedOrder};
    use crate::models::{Bar, Side};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeGateway {
        positions: Mutex<Vec<ExchangePosition>>,
        orders: Mutex<Vec<ExchangeOrder>>,
        cancelled: Mutex<Vec<String>>,
        next_order_id: Mutex<u64>,
        fail_create: bool,
    }

    impl FakeGateway {
        fn new(positions: Vec<ExchangePosition>, orders: Vec<ExchangeOrder>) -> Self {
            Self {
                positions: Mutex::new(positions),
                orders: Mutex::new(orders),
                cancelled: Mutex::new(Vec::new()),
                next_order_id: Mutex::new(100),
                fail_create: false,
            }
        }

        fn with_failing_orders(mut self) -> Self {
            self.fail_create = true;
            self
        }
    }

    #[async_trait]
    impl ExchangeGateway for FakeGateway {
        async fn get_balance(&self) -> Result<AccountBalance, ExchangeError> {
            Ok(AccountBalance {
                total_equity: 5000.0,
                available_margin: 5000.0,
                unrealized_pnl: 0.0,
            })
        }

        async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
            Ok(self.positions.lock().unwrap().clone())
        }

        async fn fetch_open_orders(
            &self,
            _symbol: Option<&str>,
        ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
            Ok(self.orders.lock().unwrap().clone())
        }

        async fn fetch_ohlcv(
            &self,
            _: &str,
            _: &str,
            _: usize,
        ) -> Result<Vec<Bar>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn fetch_user_trades(
            &self,
            _: &str,
            _: usize,
        ) -> Result<Vec<FillRecord>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn fetch_order(&self, _: &str, _: &str) -> Result<ExchangeOrder, ExchangeError> {
            Err(ExchangeError::Transport("not implemented".to_string()))
        }

        async fn create_order(
            &self,
            symbol: &str,
            order_type: OrderType,
            side: Side,
            amount: f64,
            _price: Option<f64>,
            opts: OrderOptions,
        ) -> Result<PlacedOrder, ExchangeError> {
            if self.fail_create {
                return Err(ExchangeError::Api {
                    status: 400,
                    msg: "rejected".to_string(),
                });
            }
            let mut next = self.next_order_id.lock().unwrap();
            *next += 1;
            let id = next.to_string();
            self.orders.lock().unwrap().push(ExchangeOrder {
                id: id.clone(),
                symbol: symbol.to_string(),
                order_type: order_type.as_str().to_string(),
                side: side.as_str().to_string(),
                price: 0.0,
                stop_price: opts.stop_price.unwrap_or(0.0),
                amount,
                reduce_only: opts.reduce_only,
                status: "NEW".to_string(),
            });
            Ok(PlacedOrder {
                id,
                average_price: 0.0,
                status: "NEW".to_string(),
            })
        }

        async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<(), ExchangeError> {
            self.cancelled.lock().unwrap().push(order_id.to_string());
            self.orders.lock().unwrap().retain(|o| o.id != order_id);
            Ok(())
        }

        async fn set_leverage(&self, _: &str, _: u32) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn set_margin_mode(&self, _: &str, _: &str) -> Result<(), ExchangeError> {
            Ok(())
        }
    }

    struct SilentLedger;

    #[async_trait]
    impl TradeLedger for SilentLedger {
        async fn insert_trade(&self, _: &crate::models::Trade) -> crate::Result<()> {
            Ok(())
        }
        async fn close_trade(
            &self,
            _: uuid::Uuid,
            _: &crate::models::TradeExit,
        ) -> crate::Result<()> {
            Ok(())
        }
        async fn latest_open_trade(&self, _: &str) -> crate::Result<Option<crate::models::Trade>> {
            Ok(None)
        }
        async fn save_equity_snapshot(
            &self,
            _: &crate::models::EquitySnapshot,
        ) -> crate::Result<()> {
            Ok(())
        }
        async fn daily_start_equity(
            &self,
            _: chrono::NaiveDate,
        ) -> crate::Result<Option<f64>> {
            Ok(None)
        }
        async fn record_regime(&self, _: &crate::models::RegimeResult) -> crate::Result<()> {
            Ok(())
        }
        async fn record_system_event(&self, _: &str, _: &str) -> crate::Result<()> {
            Ok(())
        }
        async fn record_component_error(&self, _: &str, _: &str) -> crate::Result<()> {
            Ok(())
        }
        async fn trade_stats(&self) -> crate::Result<crate::models::TradeStats> {
            Ok(crate::models::TradeStats::default())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        actions: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl crate::alerts::Notifier for RecordingNotifier {
        async fn trade_opened(&self, _: &str, _: Side, _: f64, _: f64, _: f64, _: f64) {}
        async fn trade_closed(&self, _: &str, _: Side, _: f64, _: crate::models::ExitReason) {}
        async fn kill_switch(&self, _: &str) {}
        async fn reconciliation_action(&self, symbol: &str, action: &str) {
            self.actions
                .lock()
                .unwrap()
                .push((symbol.to_string(), action.to_string()));
        }
        async fn component_error(&self, _: &str, _: &str) {}
        async fn heartbeat(&self, _: &str) {}
        async fn startup(&self, _: &str) {}
        async fn shutdown(&self, _: &str) {}
    }

    #[derive(Default)]
    struct EventLedger {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TradeLedger for EventLedger {
        async fn insert_trade(&self, _: &crate::models::Trade) -> crate::Result<()> {
            Ok(())
        }
        async fn close_trade(
            &self,
            _: uuid::Uuid,
            _: &crate::models::TradeExit,
        ) -> crate::Result<()> {
            Ok(())
        }
        async fn latest_open_trade(&self, _: &str) -> crate::Result<Option<crate::models::Trade>> {
            Ok(None)
        }
        async fn save_equity_snapshot(
            &self,
            _: &crate::models::EquitySnapshot,
        ) -> crate::Result<()> {
            Ok(())
        }
        async fn daily_start_equity(
            &self,
            _: chrono::NaiveDate,
        ) -> crate::Result<Option<f64>> {
            Ok(None)
        }
        async fn record_regime(&self, _: &crate::models::RegimeResult) -> crate::Result<()> {
            Ok(())
        }
        async fn record_system_event(&self, _: &str, reason: &str) -> crate::Result<()> {
            self.events.lock().unwrap().push(reason.to_string());
            Ok(())
        }
        async fn record_component_error(&self, _: &str, _: &str) -> crate::Result<()> {
            Ok(())
        }
        async fn trade_stats(&self) -> crate::Result<crate::models::TradeStats> {
            Ok(crate::models::TradeStats::default())
        }
    }

    fn position(symbol: &str, side: PositionSide) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.to_string(),
            side,
            size: 0.5,
            entry_price: 100.0,
            mark_price: 100.0,
            unrealized_pnl: 0.0,
            leverage: 2.0,
            margin_mode: "isolated".to_string(),
        }
    }

    fn protective(id: &str, symbol: &str, order_type: &str) -> ExchangeOrder {
        ExchangeOrder {
            id: id.to_string(),
            symbol: symbol.to_string(),
            order_type: order_type.to_string(),
            side: "SELL".to_string(),
            price: 0.0,
            stop_price: 95.0,
            amount: 0.5,
            reduce_only: true,
            status: "NEW".to_string(),
        }
    }

    fn make_loop(
        gateway: Arc<FakeGateway>,
        leases: Arc<ProtectionLeases>,
    ) -> ReconciliationLoop {
        ReconciliationLoop::new(
            ReconciliationConfig::default(),
            gateway,
            Arc::new(SilentLedger),
            Arc::new(NullNotifier),
            MarketDataCache::new(100),
            leases,
            "1h".to_string(),
        )
    }

    fn make_loop_observed(
        cfg: ReconciliationConfig,
        gateway: Arc<FakeGateway>,
        ledger: Arc<EventLedger>,
        notifier: Arc<RecordingNotifier>,
    ) -> ReconciliationLoop {
        ReconciliationLoop::new(
            cfg,
            gateway,
            ledger,
            notifier,
            MarketDataCache::new(100),
            Arc::new(ProtectionLeases::new(Duration::from_secs(300))),
            "1h".to_string(),
        )
    }

    #[tokio::test]
    async fn test_disabled_auto_heal_still_alerts_and_records() {
        let gateway = Arc::new(FakeGateway::new(
            vec![position("BTCUSDT", PositionSide::Long)],
            Vec::new(),
        ));
        let ledger = Arc::new(EventLedger::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let cfg = ReconciliationConfig {
            auto_add_sl: false,
            auto_add_tp: false,
            ..ReconciliationConfig::default()
        };

        let report = make_loop_observed(cfg, gateway.clone(), ledger.clone(), notifier.clone())
            .run_once()
            .await
            .unwrap();

        // Nothing placed, but the operator hears about both gaps.
        assert!(report.is_clean());
        assert!(gateway.orders.lock().unwrap().is_empty());

        let actions = notifier.actions.lock().unwrap();
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|(s, a)| s == "BTCUSDT" && a.contains("alert only")));
        assert!(actions.iter().any(|(_, a)| a.contains("missing SL")));
        assert!(actions.iter().any(|(_, a)| a.contains("missing TP")));

        let events = ledger.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.contains("alert only")));
    }

    #[tokio::test]
    async fn test_heal_failure_is_notified_and_recorded() {
        let gateway = Arc::new(
            FakeGateway::new(vec![position("BTCUSDT", PositionSide::Long)], Vec::new())
                .with_failing_orders(),
        );
        let ledger = Arc::new(EventLedger::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let report = make_loop_observed(
            ReconciliationConfig::default(),
            gateway,
            ledger.clone(),
            notifier.clone(),
        )
        .run_once()
        .await
        .unwrap();

        assert_eq!(report.stops_added, 0);
        assert_eq!(report.targets_added, 0);

        let actions = notifier.actions.lock().unwrap();
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().any(|(_, a)| a.contains("failed to add SL")));
        assert!(actions.iter().any(|(_, a)| a.contains("failed to add TP")));

        let events = ledger.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.contains("failed to add")));
    }

    #[tokio::test]
    async fn test_healthy_book_is_untouched() {
        let gateway = Arc::new(FakeGateway::new(
            vec![position("BTCUSDT", PositionSide::Long)],
            vec![
                protective("1", "BTCUSDT", "STOP_MARKET"),
                protective("2", "BTCUSDT", "TAKE_PROFIT_MARKET"),
            ],
        ));
        let leases = Arc::new(ProtectionLeases::new(Duration::from_secs(300)));
        let report = make_loop(gateway.clone(), leases).run_once().await.unwrap();
        assert!(report.is_clean());
        assert!(gateway.cancelled.lock().unwrap().is_empty());
        assert_eq!(gateway.orders.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_protection_is_healed_with_fallback_distances() {
        let gateway = Arc::new(FakeGateway::new(
            vec![position("BTCUSDT", PositionSide::Long)],
            Vec::new(),
        ));
        let leases = Arc::new(ProtectionLeases::new(Duration::from_secs(300)));
        let report = make_loop(gateway.clone(), leases).run_once().await.unwrap();

        assert_eq!(report.stops_added, 1);
        assert_eq!(report.targets_added, 1);

        let orders = gateway.orders.lock().unwrap();
        assert_eq!(orders.len(), 2);
        // No cached bars: 2% / 3% of entry scaled by the multipliers.
        let sl = orders.iter().find(|o| o.is_stop()).unwrap();
        assert!((sl.stop_price - (100.0 - 2.0 * 2.0)).abs() < 1e-9);
        assert!(sl.reduce_only);
        assert_eq!(sl.side, "SELL");
        let tp = orders.iter().find(|o| o.is_take_profit()).unwrap();
        assert!((tp.stop_price - (100.0 + 3.0 * 3.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_heal_is_idempotent() {
        let gateway = Arc::new(FakeGateway::new(
            vec![position("BTCUSDT", PositionSide::Long)],
            Vec::new(),
        ));
        let leases = Arc::new(ProtectionLeases::new(Duration::from_secs(300)));
        let rec = make_loop(gateway.clone(), leases);

        let first = rec.run_once().await.unwrap();
        assert!(!first.is_clean());
        // Second pass sees the freshly-added orders and does nothing.
        let second = rec.run_once().await.unwrap();
        assert!(second.is_clean());
        assert_eq!(gateway.orders.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_lease_defers_healing_but_not_orphan_cleanup() {
        let gateway = Arc::new(FakeGateway::new(
            vec![position("BTCUSDT", PositionSide::Long)],
            vec![protective("9", "ETHUSDT", "STOP_MARKET")],
        ));
        let leases = Arc::new(ProtectionLeases::new(Duration::from_secs(300)));
        leases.grant("BTCUSDT");

        let report = make_loop(gateway.clone(), leases).run_once().await.unwrap();
        // BTCUSDT heal deferred while its lease is live.
        assert_eq!(report.stops_added, 0);
        assert_eq!(report.targets_added, 0);
        // The ETHUSDT orphan goes regardless.
        assert_eq!(report.orphans_cancelled, 1);
        assert_eq!(gateway.cancelled.lock().unwrap().as_slice(), ["9"]);
    }

    #[tokio::test]
    async fn test_non_reduce_only_orders_are_not_orphans() {
        let mut entry_order = protective("5", "ETHUSDT", "LIMIT");
        entry_order.reduce_only = false;
        let gateway = Arc::new(FakeGateway::new(Vec::new(), vec![entry_order]));
        let leases = Arc::new(ProtectionLeases::new(Duration::from_secs(300)));

        let report = make_loop(gateway.clone(), leases).run_once().await.unwrap();
        assert_eq!(report.orphans_cancelled, 0);
        assert!(gateway.cancelled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_short_position_heals_on_correct_sides() {
        let gateway = Arc::new(FakeGateway::new(
            vec![position("BTCUSDT", PositionSide::Short)],
            Vec::new(),
        ));
        let leases = Arc::new(ProtectionLeases::new(Duration::from_secs(300)));
        make_loop(gateway.clone(), leases).run_once().await.unwrap();

        let orders = gateway.orders.lock().unwrap();
        let sl = orders.iter().find(|o| o.is_stop()).unwrap();
        // Short: stop above entry, closing side is BUY.
        assert!(sl.stop_price > 100.0);
        assert_eq!(sl.side, "BUY");
        let tp = orders.iter().find(|o| o.is_take_profit()).unwrap();
        assert!(tp.stop_price < 100.0);
    }
}
