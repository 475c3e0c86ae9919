use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::data::MarketDataCache;
use crate::models::Bar;

const MAINNET_WS_BASE: &str = "wss://fstream.binance.com";
const TESTNET_WS_BASE: &str = "wss://stream.binancefuture.com";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Combined-stream kline event envelope.
#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[allow(dead_code)]
    stream: String,
    data: KlineEvent,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: Kline,
}

#[derive(Debug, Deserialize)]
struct Kline {
    #[serde(rename = "t")]
    open_time_ms: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    closed: bool,
}

impl Kline {
    fn to_bar(&self) -> crate::Result<Bar> {
        let open_time = Utc
            .timestamp_millis_opt(self.open_time_ms)
            .single()
            .ok_or_else(|| format!("bad kline open time {}", self.open_time_ms))?;
        Ok(Bar {
            open_time,
            open: self.open.parse()?,
            high: self.high.parse()?,
            low: self.low.parse()?,
            close: self.close.parse()?,
            volume: self.volume.parse()?,
            closed: self.closed,
        })
    }
}

/// Subscribes to the combined kline stream for every configured symbol and
/// feeds parsed bars into the shared cache. Reconnects forever on any
/// disconnect; malformed frames are logged and skipped.
pub struct MarketStream {
    url: String,
    cache: Arc<MarketDataCache>,
    running: AtomicBool,
}

impl MarketStream {
    pub fn new(env: &str, symbols: &[String], timeframe: &str, cache: Arc<MarketDataCache>) -> Self {
        let base = if env.eq_ignore_ascii_case("mainnet") {
            MAINNET_WS_BASE
        } else {
            TESTNET_WS_BASE
        };
        let streams = symbols
            .iter()
            .map(|s| format!("{}@kline_{}", s.to_lowercase(), timeframe))
            .collect::<Vec<_>>()
            .join("/");
        Self {
            url: format!("{base}/stream?streams={streams}"),
            cache,
            running: AtomicBool::new(true),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run until [`stop`](Self::stop) is called. Never returns an error:
    /// every failure mode is a reconnect.
    pub async fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            info!("🔌 Connecting market stream: {}", self.url);
            match connect_async(&self.url).await {
                Ok((ws, _)) => {
                    info!("✅ Market stream connected");
                    self.read_until_disconnect(ws).await;
                }
                Err(e) => {
                    error!("❌ Market stream connect failed: {}", e);
                }
            }

            if self.running.load(Ordering::SeqCst) {
                warn!(
                    "🔄 Market stream disconnected, reconnecting in {}s",
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
        info!("🛑 Market stream stopped");
    }

    async fn read_until_disconnect<S>(&self, mut ws: S)
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        while self.running.load(Ordering::SeqCst) {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    warn!("Market stream closed by server: {:?}", frame);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Market stream read error: {}", e);
                    return;
                }
                None => return,
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let envelope: StreamEnvelope = match serde_json::from_str(text) {
            Ok(ev) => ev,
            Err(e) => {
                debug!("Skipping unparseable stream frame: {}", e);
                return;
            }
        };
        let event = envelope.data;
        if event.event_type != "kline" {
            return;
        }
        match event.kline.to_bar() {
            Ok(bar) => {
                self.cache
                    .apply_update(&event.symbol, &event.kline.interval, bar);
            }
            Err(e) => warn!("⚠️ Dropping malformed kline for {}: {}", event.symbol, e),
        }
    }
}
