use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::alerts::Notifier;
use crate::config::MonitoringConfig;
use crate::db::TradeLedger;
use crate::exchange::ExchangeGateway;
use crate::risk::KillSwitch;

/// Consecutive failed heartbeats before the operator is alerted.
const FAILURE_ALERT_THRESHOLD: u32 = 3;

/// Periodic heartbeat so a silent bot is distinguishable from a dead one.
pub struct HealthMonitor {
    cfg: MonitoringConfig,
    gateway: Arc<dyn ExchangeGateway>,
    ledger: Arc<dyn TradeLedger>,
    notifier: Arc<dyn Notifier>,
    kill_switch: Arc<KillSwitch>,
    running: AtomicBool,
}

impl HealthMonitor {
    pub fn new(
        cfg: MonitoringConfig,
        gateway: Arc<dyn ExchangeGateway>,
        ledger: Arc<dyn TradeLedger>,
        notifier: Arc<dyn Notifier>,
        kill_switch: Arc<KillSwitch>,
    ) -> Self {
        Self {
            cfg,
            gateway,
            ledger,
            notifier,
            kill_switch,
            running: AtomicBool::new(true),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn run(&self) {
        info!(
            "💓 Starting heartbeat (interval {}s)",
            self.cfg.heartbeat_interval_seconds
        );
        let mut failures: u32 = 0;
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(self.cfg.heartbeat_interval_seconds)).await;
            match self.beat().await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!("Heartbeat skipped ({} in a row): {}", failures, e);
                    if failures == FAILURE_ALERT_THRESHOLD {
                        self.notifier
                            .component_error(
                                "health",
                                &format!("{failures} consecutive heartbeat failures: {e}"),
                            )
                            .await;
                        self.ledger
                            .record_component_error(
                                "health",
                                &format!("{failures} consecutive heartbeat failures: {e}"),
                            )
                            .await
                            .ok();
                    }
                }
            }
        }
    }

    async fn beat(&self) -> crate::Result<()> {
        let line = self.status_line().await?;
        info!("💓 {}", line);
        self.notifier.heartbeat(&line).await;
        Ok(())
    }

    async fn status_line(&self) -> crate::Result<String> {
        let balance = self.gateway.get_balance().await?;
        let positions = self.gateway.fetch_positions().await?;
        let open = positions.iter().filter(|p| p.size != 0.0).count();

        let daily_pnl = self
            .ledger
            .daily_start_equity(Utc::now().date_naive())
            .await
            .unwrap_or(None)
            .map(|start| balance.total_equity - start);

        let mut line = format!(
            "equity {:.2} USDT, {} open position(s)",
            balance.total_equity, open
        );
        match daily_pnl {
            Some(pnl) => line.push_str(&format!(", daily pnl {:+.2}", pnl)),
            None => line.push_str(", daily pnl n/a"),
        }
        if self.kill_switch.is_active() {
            line.push_str(" [KILL-SWITCH ACTIVE]");
        }
        Ok(line)
    }
}
