//! The decision loop: snapshot account state, enforce the drawdown limit,
//! classify each symbol, route to a strategy, execute.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::alerts::Notifier;
use crate::config::Config;
use crate::data::MarketDataCache;
use crate::db::TradeLedger;
use crate::exchange::ExchangeGateway;
use crate::execution::Executor;
use crate::indicators::FeatureSeries;
use crate::models::{EquitySnapshot, Signal};
use crate::regime::RegimeClassifier;
use crate::risk::RiskEngine;
use crate::strategy::StrategyRouter;

pub struct TradingEngine {
    cfg: Config,
    cache: Arc<MarketDataCache>,
    classifier: Mutex<RegimeClassifier>,
    router: StrategyRouter,
    executor: Executor,
    risk: Arc<RiskEngine>,
    gateway: Arc<dyn ExchangeGateway>,
    ledger: Arc<dyn TradeLedger>,
    notifier: Arc<dyn Notifier>,
    running: AtomicBool,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        cache: Arc<MarketDataCache>,
        executor: Executor,
        risk: Arc<RiskEngine>,
        gateway: Arc<dyn ExchangeGateway>,
        ledger: Arc<dyn TradeLedger>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let classifier = Mutex::new(RegimeClassifier::new(cfg.regime.clone()));
        let router = StrategyRouter::new(cfg.strategies.clone());
        Self {
            cfg,
            cache,
            classifier,
            router,
            executor,
            risk,
            gateway,
            ledger,
            notifier,
            running: AtomicBool::new(true),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn run(&self) {
        info!(
            "🚀 Trading engine started ({} symbols, {}s cycle)",
            self.cfg.symbols.len(),
            self.cfg.cycle_seconds
        );

        let mut ticker = tokio::time::interval(Duration::from_secs(self.cfg.cycle_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if let Err(e) = self.run_cycle().await {
                error!("Trading cycle failed: {}", e);
                self.ledger
                    .record_component_error("engine", &e.to_string())
                    .await
                    .ok();
                self.notifier.component_error("engine", &e.to_string()).await;
            }
        }
        info!("Trading engine stopped");
    }

    /// One full decision cycle across all configured symbols.
    pub async fn run_cycle(&self) -> crate::Result<()> {
        let balance = self.gateway.get_balance().await?;
        let today = Utc::now().date_naive();

        // Snapshot first so the day's start equity is pinned before any
        // drawdown arithmetic happens.
        let snapshot = EquitySnapshot {
            balance: balance.total_equity - balance.unrealized_pnl,
            equity: balance.total_equity,
            unrealized_pnl: balance.unrealized_pnl,
            date: today,
        };
        if let Err(e) = self.ledger.save_equity_snapshot(&snapshot).await {
            warn!("Failed to save equity snapshot: {}", e);
        }

        match self.ledger.daily_start_equity(today).await {
            Ok(Some(start)) => {
                let was_active = self.risk.kill_switch().is_active();
                if !self.risk.check_daily_drawdown(start, balance.total_equity) && !was_active {
                    let reason = self
                        .risk
                        .kill_switch()
                        .reason()
                        .unwrap_or_else(|| "daily drawdown limit breached".to_string());
                    error!("🛑 KILL-SWITCH: {}", reason);
                    self.ledger
                        .record_system_event("KILL_SWITCH", &reason)
                        .await
                        .ok();
                    self.notifier.kill_switch(&reason).await;
                }
            }
            Ok(None) => debug!("No start-of-day equity yet"),
            Err(e) => warn!("Could not load start-of-day equity: {}", e),
        }

        if self.risk.kill_switch().is_active() {
            debug!("Kill-switch active, skipping signal evaluation");
            return Ok(());
        }

        let positions = self.gateway.fetch_positions().await?;

        for symbol in &self.cfg.symbols {
            let bars = self.cache.snapshot(symbol, &self.cfg.timeframe);
            let Some(features) = FeatureSeries::compute(&bars) else {
                debug!("[{}] Not enough bars for features yet ({})", symbol, bars.len());
                continue;
            };

            let regime = {
                let Ok(mut classifier) = self.classifier.lock() else {
                    return Err("regime classifier state poisoned".into());
                };
                classifier.detect_regime(symbol, bars.len(), &features)
            };
            debug!(
                "[{}] regime {} (proposed {}, confidence {:.2})",
                symbol, regime.confirmed, regime.proposed, regime.confidence
            );
            if let Err(e) = self.ledger.record_regime(&regime).await {
                warn!("[{}] Failed to record regime: {}", symbol, e);
            }

            let signal = self.router.check_signal(&bars, &features, &regime);
            if let Signal::Entry(entry) = signal {
                self.executor
                    .execute_signal(&entry, balance.total_equity, &positions, regime.confirmed)
                    .await;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::NullNotifier;
    use crate::exchange::{
        AccountBalance, ExchangeError, FillRecord, OrderOptions, OrderType, PlacedOrder,
    };
    use crate::execution::ProtectionLeases;
    use crate::models::{
        Bar, ExchangeOrder, ExchangePosition, RegimeResult, Side, Trade, TradeExit, TradeStats,
    };
    use crate::risk::KillSwitch;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct FakeGateway {
        equity: f64,
    }

    #[async_trait]
    impl ExchangeGateway for FakeGateway {
        async fn get_balance(&self) -> Result<AccountBalance, ExchangeError> {
            Ok(AccountBalance {
                total_equity: self.equity,
                available_margin: self.equity,
                unrealized_pnl: 0.0,
            })
        }
        async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
            Ok(Vec::new())
        }
        async fn fetch_open_orders(
            &self,
            _: Option<&str>,
        ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
            Ok(Vec::new())
        }
        async fn fetch_ohlcv(&self, _: &str, _: &str, _: usize) -> Result<Vec<Bar>, ExchangeError> {
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
            Err(ExchangeError::Transport("none".to_string()))
        }
        async fn create_order(
            &self,
            _: &str,
            _: OrderType,
            _: Side,
            _: f64,
            _: Option<f64>,
            _: OrderOptions,
        ) -> Result<PlacedOrder, ExchangeError> {
            Ok(PlacedOrder {
                id: "1".to_string(),
                average_price: 0.0,
                status: "FILLED".to_string(),
            })
        }
        async fn cancel_order(&self, _: &str, _: &str) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn set_leverage(&self, _: &str, _: u32) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn set_margin_mode(&self, _: &str, _: &str) -> Result<(), ExchangeError> {
            Ok(())
        }
    }

    struct FakeLedger {
        start_equity: f64,
        snapshots: std::sync::Mutex<Vec<EquitySnapshot>>,
        events: std::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TradeLedger for FakeLedger {
        async fn insert_trade(&self, _: &Trade) -> crate::Result<()> {
            Ok(())
        }
        async fn close_trade(&self, _: Uuid, _: &TradeExit) -> crate::Result<()> {
            Ok(())
        }
        async fn latest_open_trade(&self, _: &str) -> crate::Result<Option<Trade>> {
            Ok(None)
        }
        async fn save_equity_snapshot(&self, s: &EquitySnapshot) -> crate::Result<()> {
            self.snapshots.lock().unwrap().push(s.clone());
            Ok(())
        }
        async fn daily_start_equity(&self, _: chrono::NaiveDate) -> crate::Result<Option<f64>> {
            Ok(Some(self.start_equity))
        }
        async fn record_regime(&self, _: &RegimeResult) -> crate::Result<()> {
            Ok(())
        }
        async fn record_system_event(&self, event_type: &str, reason: &str) -> crate::Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((event_type.to_string(), reason.to_string()));
            Ok(())
        }
        async fn record_component_error(&self, _: &str, _: &str) -> crate::Result<()> {
            Ok(())
        }
        async fn trade_stats(&self) -> crate::Result<TradeStats> {
            Ok(TradeStats::default())
        }
    }

    fn engine(equity: f64, start_equity: f64) -> (TradingEngine, Arc<FakeLedger>, Arc<KillSwitch>) {
        let cfg = Config::default();
        let gateway: Arc<dyn ExchangeGateway> = Arc::new(FakeGateway { equity });
        let ledger = Arc::new(FakeLedger {
            start_equity,
            snapshots: std::sync::Mutex::new(Vec::new()),
            events: std::sync::Mutex::new(Vec::new()),
        });
        let notifier: Arc<dyn Notifier> = Arc::new(NullNotifier);
        let kill_switch = Arc::new(KillSwitch::new());
        let risk = Arc::new(RiskEngine::new(cfg.risk.clone(), kill_switch.clone()));
        let leases = Arc::new(ProtectionLeases::new(Duration::from_secs(300)));
        let executor = Executor::new(
            gateway.clone(),
            ledger.clone(),
            notifier.clone(),
            risk.clone(),
            leases,
            cfg.risk.margin_mode.clone(),
            cfg.risk.leverage,
        );
        let cache = MarketDataCache::new(cfg.max_cached_bars);
        let engine = TradingEngine::new(
            cfg,
            cache,
            executor,
            risk,
            gateway,
            ledger.clone(),
            notifier,
        );
        (engine, ledger, kill_switch)
    }

    #[tokio::test]
    async fn test_cycle_snapshots_equity() {
        let (engine, ledger, _) = engine(5000.0, 5000.0);
        engine.run_cycle().await.unwrap();
        let snapshots = ledger.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!((snapshots[0].equity - 5000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_drawdown_breach_trips_kill_switch_once() {
        // 10% down against a 5% limit.
        let (engine, ledger, kill_switch) = engine(4500.0, 5000.0);
        engine.run_cycle().await.unwrap();
        assert!(kill_switch.is_active());
        {
            let events = ledger.events.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].0, "KILL_SWITCH");
        }

        // Second cycle: still active, but no duplicate event.
        engine.run_cycle().await.unwrap();
        assert_eq!(ledger.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_survives_empty_cache() {
        let (engine, _, kill_switch) = engine(5000.0, 5000.0);
        engine.run_cycle().await.unwrap();
        assert!(!kill_switch.is_active());
    }
}
