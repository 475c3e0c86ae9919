use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One OHLCV bar for a (symbol, timeframe) stream.
///
/// Bars are immutable once `closed` is true; the most recent bar in a cache
/// window may still be forming and is replaced in place by stream updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}

/// Order side for entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// The side of a reduce-only order that closes a position opened this way.
    pub fn closing_side(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s.to_uppercase().as_str() {
            "BUY" | "LONG" => Some(Side::Buy),
            "SELL" | "SHORT" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of an exchange-held position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn closing_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        }
    }
}

/// Market regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    TrendBull,
    TrendBear,
    Range,
    Squeeze,
    NoTrade,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::TrendBull => "TREND_BULL",
            Regime::TrendBear => "TREND_BEAR",
            Regime::Range => "RANGE",
            Regime::Squeeze => "SQUEEZE",
            Regime::NoTrade => "NO_TRADE",
        }
    }

    pub fn is_trend(&self) -> bool {
        matches!(self, Regime::TrendBull | Regime::TrendBear)
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature values the classifier saw when it produced a regime result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeFeatures {
    pub adx: f64,
    pub bb_width: f64,
    pub ema_sep: f64,
    pub adx_threshold_high: f64,
    pub adx_threshold_low: f64,
    pub bw_threshold_low: f64,
    pub pending_regime: Option<Regime>,
    pub pending_count: u32,
}

/// Output of one classification step.
///
/// `proposed` is the instantaneous label; `confirmed` is hysteresis-stabilized
/// and is the only value downstream routing may act on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeResult {
    pub symbol: String,
    pub confirmed: Regime,
    pub proposed: Regime,
    pub confidence: f64,
    pub features: RegimeFeatures,
    pub reason: String,
}

/// A candidate entry produced by a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySignal {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub confidence: f64,
    pub atr: Option<f64>,
    pub reason: String,
}

impl EntrySignal {
    /// Stop and target must sit on the geometrically correct side of entry:
    /// SL < entry < TP for longs, TP < entry < SL for shorts.
    pub fn levels_valid(&self) -> bool {
        match self.side {
            Side::Buy => self.stop_loss < self.entry_price && self.entry_price < self.take_profit,
            Side::Sell => self.take_profit < self.entry_price && self.entry_price < self.stop_loss,
        }
    }
}

/// Strategy output: either nothing actionable, or a fully-specified entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    None,
    Entry(EntrySignal),
}

impl Signal {
    pub fn is_none(&self) -> bool {
        matches!(self, Signal::None)
    }
}

/// A position as reported by the exchange. Read-only to the core; the
/// exchange copy is authoritative.
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
    pub margin_mode: String,
}

/// An open order as reported by the exchange.
#[derive(Debug, Clone)]
pub struct ExchangeOrder {
    pub id: String,
    pub symbol: String,
    pub order_type: String,
    pub side: String,
    pub price: f64,
    pub stop_price: f64,
    pub amount: f64,
    pub reduce_only: bool,
    pub status: String,
}

impl ExchangeOrder {
    /// Protective stop order (STOP / STOP_MARKET variants, not take-profit).
    pub fn is_stop(&self) -> bool {
        let t = self.order_type.to_uppercase();
        t.contains("STOP") && !t.contains("TAKE")
    }

    /// Take-profit order (TAKE_PROFIT / TAKE_PROFIT_MARKET variants).
    pub fn is_take_profit(&self) -> bool {
        self.order_type.to_uppercase().contains("TAKE_PROFIT")
    }
}

/// Why a trade left the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TpHit,
    SlHit,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TpHit => "TP_HIT",
            ExitReason::SlHit => "SL_HIT",
            ExitReason::Manual => "MANUAL",
        }
    }

    pub fn parse(s: &str) -> Option<ExitReason> {
        match s {
            "TP_HIT" => Some(ExitReason::TpHit),
            "SL_HIT" => Some(ExitReason::SlHit),
            "MANUAL" => Some(ExitReason::Manual),
            _ => None,
        }
    }
}

/// Local trade ledger row. Created on entry fill; exit fields are set exactly
/// once by the position monitor when closure is detected.
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: Uuid,
    pub symbol: String,
    pub strategy: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub size: f64,
    pub sl_price: f64,
    pub tp_price: f64,
    pub fee: Option<f64>,
    pub pnl: Option<f64>,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub regime_at_entry: Regime,
}

/// Exit fields applied to an open trade on closure detection.
#[derive(Debug, Clone)]
pub struct TradeExit {
    pub exit_price: f64,
    pub fee: f64,
    pub pnl: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: ExitReason,
}

/// Daily equity snapshot used for drawdown tracking. One row per calendar
/// day; `start_equity` is fixed at first insert, the rest is refreshed.
#[derive(Debug, Clone)]
pub struct EquitySnapshot {
    pub balance: f64,
    pub equity: f64,
    pub unrealized_pnl: f64,
    pub date: chrono::NaiveDate,
}

/// Aggregate trade statistics for observability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeStats {
    pub total_trades: i64,
    pub open_trades: i64,
    pub wins: i64,
    pub losses: i64,
    pub win_rate: f64,
    pub realized_pnl: f64,
    pub total_fees: f64,
    pub net_pnl: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(side: Side, sl: f64, entry: f64, tp: f64) -> EntrySignal {
        EntrySignal {
            symbol: "BTCUSDT".to_string(),
            side,
            entry_price: entry,
            stop_loss: sl,
            take_profit: tp,
            confidence: 0.5,
            atr: None,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn test_buy_levels_valid() {
        assert!(signal(Side::Buy, 95.0, 100.0, 110.0).levels_valid());
        // Stop above entry is never valid for a long
        assert!(!signal(Side::Buy, 110.0, 100.0, 120.0).levels_valid());
        // Target below entry is never valid for a long
        assert!(!signal(Side::Buy, 95.0, 100.0, 98.0).levels_valid());
    }

    #[test]
    fn test_sell_levels_valid() {
        assert!(signal(Side::Sell, 105.0, 100.0, 90.0).levels_valid());
        assert!(!signal(Side::Sell, 95.0, 100.0, 90.0).levels_valid());
        assert!(!signal(Side::Sell, 105.0, 100.0, 102.0).levels_valid());
    }

    #[test]
    fn test_order_type_classification() {
        let mut order = ExchangeOrder {
            id: "1".to_string(),
            symbol: "BTCUSDT".to_string(),
            order_type: "STOP_MARKET".to_string(),
            side: "sell".to_string(),
            price: 0.0,
            stop_price: 95.0,
            amount: 1.0,
            reduce_only: true,
            status: "NEW".to_string(),
        };
        assert!(order.is_stop());
        assert!(!order.is_take_profit());

        order.order_type = "TAKE_PROFIT_MARKET".to_string();
        assert!(order.is_take_profit());
        assert!(!order.is_stop());

        order.order_type = "take_profit".to_string();
        assert!(order.is_take_profit());
    }

    #[test]
    fn test_closing_sides() {
        assert_eq!(Side::Buy.closing_side(), Side::Sell);
        assert_eq!(PositionSide::Short.closing_side(), Side::Buy);
    }

    #[test]
    fn test_side_parse() {
        assert_eq!(Side::parse("buy"), Some(Side::Buy));
        assert_eq!(Side::parse("SHORT"), Some(Side::Sell));
        assert_eq!(Side::parse("NONE"), None);
    }
}
