use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::models::{EquitySnapshot, ExitReason, RegimeResult, Side, Trade, TradeExit, TradeStats};
use crate::Result;

use super::TradeLedger;

/// Postgres-backed trade ledger.
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Connect and run pending migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres trade ledger");
        Ok(Self { pool })
    }
}

fn to_decimal(value: f64) -> Result<Decimal> {
    Ok(value.to_string().parse::<Decimal>()?)
}

fn to_decimal_opt(value: Option<f64>) -> Result<Option<Decimal>> {
    value.map(to_decimal).transpose()
}

fn from_decimal(value: Decimal) -> Result<f64> {
    Ok(value.to_string().parse::<f64>()?)
}

fn trade_from_row(row: &sqlx::postgres::PgRow) -> Result<Trade> {
    let side_str: String = row.get("side");
    let side = Side::parse(&side_str).ok_or_else(|| format!("invalid trade side {side_str}"))?;

    let regime_str: String = row.get("regime_at_entry");
    let regime = match regime_str.as_str() {
        "TREND_BULL" => crate::models::Regime::TrendBull,
        "TREND_BEAR" => crate::models::Regime::TrendBear,
        "RANGE" => crate::models::Regime::Range,
        "SQUEEZE" => crate::models::Regime::Squeeze,
        _ => crate::models::Regime::NoTrade,
    };

    let exit_reason_str: Option<String> = row.get("exit_reason");
    let exit_reason = match exit_reason_str.as_deref() {
        Some(s) => Some(ExitReason::parse(s).ok_or_else(|| format!("invalid exit reason {s}"))?),
        None => None,
    };

    let entry_price: Decimal = row.get("entry_price");
    let exit_price: Option<Decimal> = row.get("exit_price");
    let size: Decimal = row.get("size");
    let sl_price: Decimal = row.get("sl_price");
    let tp_price: Decimal = row.get("tp_price");
    let fee: Option<Decimal> = row.get("fee");
    let pnl: Option<Decimal> = row.get("pnl");
    let entry_time: DateTime<Utc> = row.get("entry_time");
    let exit_time: Option<DateTime<Utc>> = row.get("exit_time");

    Ok(Trade {
        id: row.get("id"),
        symbol: row.get("symbol"),
        strategy: row.get("strategy"),
        side,
        entry_price: from_decimal(entry_price)?,
        exit_price: exit_price.map(from_decimal).transpose()?,
        size: from_decimal(size)?,
        sl_price: from_decimal(sl_price)?,
        tp_price: from_decimal(tp_price)?,
        fee: fee.map(from_decimal).transpose()?,
        pnl: pnl.map(from_decimal).transpose()?,
        entry_time,
        exit_time,
        exit_reason,
        regime_at_entry: regime,
    })
}

#[async_trait]
impl TradeLedger for PostgresLedger {
    async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, symbol, strategy, side, entry_price, size,
                sl_price, tp_price, entry_time, regime_at_entry
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(trade.id)
        .bind(&trade.symbol)
        .bind(&trade.strategy)
        .bind(trade.side.as_str())
        .bind(to_decimal(trade.entry_price)?)
        .bind(to_decimal(trade.size)?)
        .bind(to_decimal(trade.sl_price)?)
        .bind(to_decimal(trade.tp_price)?)
        .bind(trade.entry_time)
        .bind(trade.regime_at_entry.as_str())
        .execute(&self.pool)
        .await?;

        tracing::debug!("Recorded trade {} for {}", trade.id, trade.symbol);
        Ok(())
    }

    async fn close_trade(&self, id: Uuid, exit: &TradeExit) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades
            SET exit_price = $2, fee = $3, pnl = $4, exit_time = $5, exit_reason = $6
            WHERE id = $1 AND exit_time IS NULL
            "#,
        )
        .bind(id)
        .bind(to_decimal(exit.exit_price)?)
        .bind(to_decimal(exit.fee)?)
        .bind(to_decimal(exit.pnl)?)
        .bind(exit.exit_time)
        .bind(exit.exit_reason.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_open_trade(&self, symbol: &str) -> Result<Option<Trade>> {
        let row = sqlx::query(
            r#"
            SELECT id, symbol, strategy, side, entry_price, exit_price, size,
                   sl_price, tp_price, fee, pnl, entry_time, exit_time,
                   exit_reason, regime_at_entry
            FROM trades
            WHERE symbol = $1 AND exit_time IS NULL
            ORDER BY entry_time DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(trade_from_row).transpose()
    }

    async fn save_equity_snapshot(&self, snapshot: &EquitySnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO equity_snapshots
                (snapshot_date, balance, equity, unrealized_pnl, start_equity)
            VALUES ($1, $2, $3, $4, $3)
            ON CONFLICT (snapshot_date) DO UPDATE SET
                balance = EXCLUDED.balance,
                equity = EXCLUDED.equity,
                unrealized_pnl = EXCLUDED.unrealized_pnl,
                updated_at = NOW()
            "#,
        )
        .bind(snapshot.date)
        .bind(to_decimal(snapshot.balance)?)
        .bind(to_decimal(snapshot.equity)?)
        .bind(to_decimal(snapshot.unrealized_pnl)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn daily_start_equity(&self, date: NaiveDate) -> Result<Option<f64>> {
        let row = sqlx::query(
            "SELECT start_equity FROM equity_snapshots WHERE snapshot_date = $1",
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let start: Decimal = row.get("start_equity");
                Ok(Some(from_decimal(start)?))
            }
            None => Ok(None),
        }
    }

    async fn record_regime(&self, result: &RegimeResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO regimes (symbol, regime, proposed, confidence, features)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&result.symbol)
        .bind(result.confirmed.as_str())
        .bind(result.proposed.as_str())
        .bind(to_decimal(result.confidence)?)
        .bind(serde_json::to_value(&result.features)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_system_event(&self, event_type: &str, reason: &str) -> Result<()> {
        sqlx::query("INSERT INTO system_events (event_type, reason) VALUES ($1, $2)")
            .bind(event_type)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_component_error(&self, component: &str, message: &str) -> Result<()> {
        sqlx::query("INSERT INTO system_errors (component, message) VALUES ($1, $2)")
            .bind(component)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn trade_stats(&self) -> Result<TradeStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_trades,
                COUNT(*) FILTER (WHERE exit_time IS NULL) AS open_trades,
                COUNT(*) FILTER (WHERE pnl > 0) AS wins,
                COUNT(*) FILTER (WHERE pnl <= 0 AND exit_time IS NOT NULL) AS losses,
                COALESCE(SUM(pnl), 0) AS realized_pnl,
                COALESCE(SUM(fee), 0) AS total_fees
            FROM trades
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total_trades: i64 = row.get("total_trades");
        let open_trades: i64 = row.get("open_trades");
        let wins: i64 = row.get("wins");
        let losses: i64 = row.get("losses");
        let realized_pnl: Decimal = row.get("realized_pnl");
        let total_fees: Decimal = row.get("total_fees");

        let realized_pnl = from_decimal(realized_pnl)?;
        let total_fees = from_decimal(total_fees)?;
        let closed = wins + losses;

        Ok(TradeStats {
            total_trades,
            open_trades,
            wins,
            losses,
            win_rate: if closed > 0 {
                wins as f64 / closed as f64
            } else {
                0.0
            },
            realized_pnl,
            total_fees,
            net_pnl: realized_pnl - total_fees,
        })
    }
}
