use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use perpbot::alerts::{Notifier, NullNotifier, TelegramNotifier};
use perpbot::config::Config;
use perpbot::data::MarketDataCache;
use perpbot::db::{PostgresLedger, TradeLedger};
use perpbot::engine::TradingEngine;
use perpbot::exchange::{BinanceGateway, ExchangeGateway, MarketStream, OrderOptions, OrderType};
use perpbot::execution::{Executor, ProtectionLeases};
use perpbot::monitoring::{HealthMonitor, PositionMonitor, ReconciliationLoop};
use perpbot::risk::{KillSwitch, RiskEngine};

#[derive(Parser, Debug)]
#[command(name = "perpbot", about = "Autonomous perpetual futures trading bot")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "perpbot.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> perpbot::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;
    let env = std::env::var("BINANCE_ENV").unwrap_or_else(|_| "testnet".to_string());
    info!(
        "Starting perpbot ({}) on {:?} {}",
        env, cfg.symbols, cfg.timeframe
    );

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| "DATABASE_URL is required")?;
    let ledger: Arc<dyn TradeLedger> = Arc::new(PostgresLedger::new(&database_url).await?);

    let api_key = std::env::var("BINANCE_API_KEY").map_err(|_| "BINANCE_API_KEY is required")?;
    let api_secret =
        std::env::var("BINANCE_API_SECRET").map_err(|_| "BINANCE_API_SECRET is required")?;
    let gateway: Arc<dyn ExchangeGateway> =
        Arc::new(BinanceGateway::new(api_key, api_secret, &env)?);

    let notifier: Arc<dyn Notifier> = match TelegramNotifier::from_env() {
        Some(telegram) => Arc::new(telegram),
        None => {
            warn!("TG_BOT_TOKEN/TG_CHAT_ID not set, operator alerts disabled");
            Arc::new(NullNotifier)
        }
    };

    // Seed the bar cache over REST before the websocket takes over.
    let cache = MarketDataCache::new(cfg.max_cached_bars);
    for symbol in &cfg.symbols {
        let bars = gateway
            .fetch_ohlcv(symbol, &cfg.timeframe, cfg.preload_bars)
            .await?;
        info!("📊 Preloaded {} {} bars for {}", bars.len(), cfg.timeframe, symbol);
        cache.preload(symbol, &cfg.timeframe, bars);
    }

    let kill_switch = Arc::new(KillSwitch::new());
    let risk = Arc::new(RiskEngine::new(cfg.risk.clone(), kill_switch.clone()));
    let leases = Arc::new(ProtectionLeases::new(Duration::from_secs(
        cfg.reconciliation.protection_lease_seconds,
    )));

    let executor = Executor::new(
        gateway.clone(),
        ledger.clone(),
        notifier.clone(),
        risk.clone(),
        leases.clone(),
        cfg.risk.margin_mode.clone(),
        cfg.risk.leverage,
    );

    let stream = Arc::new(MarketStream::new(
        &env,
        &cfg.symbols,
        &cfg.timeframe,
        cache.clone(),
    ));
    let engine = Arc::new(TradingEngine::new(
        cfg.clone(),
        cache.clone(),
        executor,
        risk.clone(),
        gateway.clone(),
        ledger.clone(),
        notifier.clone(),
    ));
    let reconciliation = Arc::new(ReconciliationLoop::new(
        cfg.reconciliation.clone(),
        gateway.clone(),
        ledger.clone(),
        notifier.clone(),
        cache.clone(),
        leases.clone(),
        cfg.timeframe.clone(),
    ));
    let position_monitor = Arc::new(PositionMonitor::new(
        cfg.monitoring.clone(),
        gateway.clone(),
        ledger.clone(),
        notifier.clone(),
    ));
    let health = Arc::new(HealthMonitor::new(
        cfg.monitoring.clone(),
        gateway.clone(),
        ledger.clone(),
        notifier.clone(),
        kill_switch.clone(),
    ));

    let mut tasks = Vec::new();
    {
        let stream = stream.clone();
        tasks.push(tokio::spawn(async move { stream.run().await }));
    }
    {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move { engine.run().await }));
    }
    {
        let reconciliation = reconciliation.clone();
        tasks.push(tokio::spawn(async move { reconciliation.run().await }));
    }
    {
        let position_monitor = position_monitor.clone();
        tasks.push(tokio::spawn(async move { position_monitor.run().await }));
    }
    {
        let health = health.clone();
        tasks.push(tokio::spawn(async move { health.run().await }));
    }

    ledger.record_system_event("STARTUP", &env).await.ok();
    notifier
        .startup(&format!("perpbot online ({}, {:?})", env, cfg.symbols))
        .await;

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutdown signal received");

    engine.stop();
    stream.stop();
    reconciliation.stop();
    position_monitor.stop();
    health.stop();

    if let Err(e) = wind_down(&cfg, gateway.as_ref()).await {
        error!("Shutdown cleanup failed: {}", e);
    }

    for task in tasks {
        task.abort();
    }
    ledger.record_system_event("SHUTDOWN", "operator signal").await.ok();
    notifier.shutdown("perpbot stopped").await;
    Ok(())
}

/// Flatten the book on the way out, per the shutdown policy.
async fn wind_down(cfg: &Config, gateway: &dyn ExchangeGateway) -> perpbot::Result<()> {
    if cfg.shutdown.cancel_orders {
        for order in gateway.fetch_open_orders(None).await? {
            info!("Cancelling open order {} ({})", order.id, order.symbol);
            if let Err(e) = gateway.cancel_order(&order.id, &order.symbol).await {
                error!("Failed to cancel order {}: {}", order.id, e);
            }
        }
    }

    if cfg.shutdown.close_positions {
        for position in gateway.fetch_positions().await? {
            if position.size == 0.0 {
                continue;
            }
            info!(
                "Closing {} position in {} ({} units)",
                position.side.closing_side(),
                position.symbol,
                position.size
            );
            let result = gateway
                .create_order(
                    &position.symbol,
                    OrderType::Market,
                    position.side.closing_side(),
                    position.size,
                    None,
                    OrderOptions {
                        stop_price: None,
                        reduce_only: true,
                    },
                )
                .await;
            if let Err(e) = result {
                error!("Failed to close {} position: {}", position.symbol, e);
            }
        }
    }
    Ok(())
}
