//! Trade ledger persistence.
//!
//! The exchange is the source of truth for live state; the ledger records
//! history for accounting and analytics. Loops degrade gracefully when a
//! ledger write fails.

mod postgres;

pub use postgres::PostgresLedger;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::models::{EquitySnapshot, RegimeResult, Trade, TradeExit, TradeStats};
use crate::Result;

/// Storage interface for trades, equity snapshots, and audit events.
#[async_trait]
pub trait TradeLedger: Send + Sync {
    /// Record a freshly-opened trade.
    async fn insert_trade(&self, trade: &Trade) -> Result<()>;

    /// Set exit fields on an open trade. Must be a no-op for already-closed
    /// rows so closure detection stays idempotent.
    async fn close_trade(&self, id: Uuid, exit: &TradeExit) -> Result<()>;

    /// Most recent trade for a symbol that has no exit yet.
    async fn latest_open_trade(&self, symbol: &str) -> Result<Option<Trade>>;

    /// Upsert today's equity snapshot. The day's `start_equity` is fixed by
    /// the first insert; later upserts refresh only the live figures.
    async fn save_equity_snapshot(&self, snapshot: &EquitySnapshot) -> Result<()>;

    /// Equity at the start of the given day, if a snapshot exists.
    async fn daily_start_equity(&self, date: NaiveDate) -> Result<Option<f64>>;

    async fn record_regime(&self, result: &RegimeResult) -> Result<()>;

    async fn record_system_event(&self, event_type: &str, reason: &str) -> Result<()>;

    async fn record_component_error(&self, component: &str, message: &str) -> Result<()>;

    /// Aggregate win/loss/PnL statistics over closed trades.
    async fn trade_stats(&self) -> Result<TradeStats>;
}
