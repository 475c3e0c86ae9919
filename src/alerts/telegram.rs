use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, error};

use crate::models::{ExitReason, Side};

use super::Notifier;

/// Sends HTML-formatted messages to a Telegram chat. Every send failure is
/// swallowed after logging.
pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    /// Built from `TG_BOT_TOKEN` / `TG_CHAT_ID`; None when either is unset.
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("TG_BOT_TOKEN").ok()?;
        let chat_id = std::env::var("TG_CHAT_ID").ok()?;
        Some(Self {
            client: Client::new(),
            bot_token,
            chat_id,
        })
    }

    async fn send(&self, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        match self.client.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Telegram message sent");
            }
            Ok(response) => {
                error!("Telegram API error: {}", response.status());
            }
            Err(e) => {
                error!("Failed to send Telegram message: {}", e);
            }
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn trade_opened(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
    ) {
        let emoji = if side == Side::Buy { "🟢" } else { "🔴" };
        self.send(&format!(
            "{emoji} <b>Trade Opened</b>\nSymbol: <code>{symbol}</code>\nSide: {side}\n\
             Size: {size:.4}\nEntry: ${entry_price:.2}\nSL: ${stop_loss:.2}\nTP: ${take_profit:.2}"
        ))
        .await;
    }

    async fn trade_closed(&self, symbol: &str, side: Side, pnl: f64, reason: ExitReason) {
        let emoji = if pnl > 0.0 { "💰" } else { "💸" };
        let sign = if pnl > 0.0 { "+" } else { "" };
        self.send(&format!(
            "{emoji} <b>Trade Closed</b>\nSymbol: <code>{symbol}</code>\nSide: {side}\n\
             PnL: {sign}${pnl:.2}\nReason: {}",
            reason.as_str()
        ))
        .await;
    }

    async fn kill_switch(&self, reason: &str) {
        self.send(&format!(
            "🚨 <b>KILL-SWITCH ACTIVATED</b> 🚨\n\n{reason}\n\nNo new entries until reset."
        ))
        .await;
    }

    async fn reconciliation_action(&self, symbol: &str, action: &str) {
        self.send(&format!(
            "🔧 <b>Reconciliation</b>\nSymbol: <code>{symbol}</code>\n{action}"
        ))
        .await;
    }

    async fn component_error(&self, component: &str, message: &str) {
        self.send(&format!("⚠️ <b>Error</b> [{component}]\n{message}"))
            .await;
    }

    async fn heartbeat(&self, message: &str) {
        self.send(&format!("💓 <b>Heartbeat</b>\n{message}")).await;
    }

    async fn startup(&self, message: &str) {
        self.send(&format!("🚀 <b>Bot Started</b>\n{message}")).await;
    }

    async fn shutdown(&self, message: &str) {
        self.send(&format!("🛑 <b>Bot Stopped</b>\n{message}")).await;
    }
}

/// No-op notifier for setups without Telegram credentials.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn trade_opened(&self, _: &str, _: Side, _: f64, _: f64, _: f64, _: f64) {}
    async fn trade_closed(&self, _: &str, _: Side, _: f64, _: ExitReason) {}
    async fn kill_switch(&self, _: &str) {}
    async fn reconciliation_action(&self, _: &str, _: &str) {}
    async fn component_error(&self, _: &str, _: &str) {}
    async fn heartbeat(&self, _: &str) {}
    async fn startup(&self, _: &str) {}
    async fn shutdown(&self, _: &str) {}
}
