//! Operator notifications. Fire-and-forget: a failed alert is logged and
//! never blocks or fails a trading path.

mod telegram;

pub use telegram::{NullNotifier, TelegramNotifier};

use async_trait::async_trait;

use crate::models::{ExitReason, Side};

/// Outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn trade_opened(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
    );

    async fn trade_closed(&self, symbol: &str, side: Side, pnl: f64, reason: ExitReason);

    async fn kill_switch(&self, reason: &str);

    async fn reconciliation_action(&self, symbol: &str, action: &str);

    async fn component_error(&self, component: &str, message: &str);

    async fn heartbeat(&self, message: &str);

    async fn startup(&self, message: &str);

    async fn shutdown(&self, message: &str);
}
