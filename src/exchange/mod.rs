//! Exchange connectivity: the gateway trait the rest of the bot programs
//! against, the Binance USD-M futures implementation, the kline websocket
//! stream, and request pacing.

mod binance;
mod rate_gate;
mod stream;

pub use binance::BinanceGateway;
pub use rate_gate::RateGate;
pub use stream::MarketStream;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Bar, ExchangeOrder, ExchangePosition, Side};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("rate limited by exchange")]
    RateLimited,
    #[error("exchange API error ({status}): {msg}")]
    Api { status: u16, msg: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response parse error: {0}")]
    Parse(String),
}

impl ExchangeError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ExchangeError::RateLimited)
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Transport(e.to_string())
    }
}

/// Order types the bot places.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// Account-level balance figures, USDT-denominated.
#[derive(Debug, Clone, Copy)]
pub struct AccountBalance {
    pub total_equity: f64,
    pub available_margin: f64,
    pub unrealized_pnl: f64,
}

/// One fill from the user trade history, used to reconstruct exit prices.
#[derive(Debug, Clone)]
pub struct FillRecord {
    pub order_id: String,
    pub price: f64,
    pub qty: f64,
    pub fee: f64,
    pub time: DateTime<Utc>,
}

/// Result of submitting an order.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub id: String,
    pub average_price: f64,
    pub status: String,
}

/// Extra order parameters beyond the core tuple.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderOptions {
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
}

/// Everything the bot needs from a derivatives venue.
///
/// The live implementation is [`BinanceGateway`]; tests substitute fakes.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn get_balance(&self) -> Result<AccountBalance, ExchangeError>;

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError>;

    async fn fetch_user_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<FillRecord>, ExchangeError>;

    async fn fetch_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError>;

    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: Side,
        amount: f64,
        price: Option<f64>,
        opts: OrderOptions,
    ) -> Result<PlacedOrder, ExchangeError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> Result<(), ExchangeError>;
}
