use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::{Bar, ExchangeOrder, ExchangePosition, PositionSide, Side};

use super::{
    AccountBalance, ExchangeError, ExchangeGateway, FillRecord, OrderOptions, OrderType,
    PlacedOrder, RateGate,
};

const TESTNET_BASE_URL: &str = "https://testnet.binancefuture.com";
const MAINNET_BASE_URL: &str = "https://fapi.binance.com";

type HmacSha256 = Hmac<Sha256>;

/// Per-symbol trading rules cached from /fapi/v1/exchangeInfo.
#[derive(Debug, Clone, Copy)]
struct SymbolInfo {
    quantity_precision: u32,
    price_precision: u32,
    step_size: f64,
    tick_size: f64,
}

impl Default for SymbolInfo {
    fn default() -> Self {
        Self {
            quantity_precision: 3,
            price_precision: 2,
            step_size: 0.001,
            tick_size: 0.01,
        }
    }
}

/// Binance USD-M futures gateway: signed REST with request pacing and
/// precision-aware order submission.
pub struct BinanceGateway {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    gate: RateGate,
    symbol_info: RwLock<HashMap<String, SymbolInfo>>,
}

impl BinanceGateway {
    /// Build from credentials; `env` selects "testnet" or "mainnet".
    pub fn new(api_key: String, api_secret: String, env: &str) -> crate::Result<Self> {
        let base_url = if env.eq_ignore_ascii_case("mainnet") {
            MAINNET_BASE_URL
        } else {
            TESTNET_BASE_URL
        };
        info!("🔌 Binance gateway initialized in {} mode", env.to_uppercase());
        Ok(Self::with_base_url(api_key, api_secret, base_url.to_string())?)
    }

    /// Build against an explicit base URL (tests point this at a mock server).
    pub fn with_base_url(
        api_key: String,
        api_secret: String,
        base_url: String,
    ) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            api_secret,
            gate: RateGate::new(),
            symbol_info: RwLock::new(HashMap::new()),
        })
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Parse(format!("bad API secret: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn encode_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        mut params: Vec<(&str, String)>,
        signed: bool,
    ) -> Result<Value, ExchangeError> {
        self.gate.acquire().await;

        let query = if signed {
            params.push(("timestamp", Self::timestamp_ms().to_string()));
            let unsigned = Self::encode_query(&params);
            let signature = self.sign(&unsigned)?;
            format!("{unsigned}&signature={signature}")
        } else {
            Self::encode_query(&params)
        };

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}{}?{}", self.base_url, endpoint, query)
        };

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            self.gate.report_rate_limit();
            return Err(ExchangeError::RateLimited);
        }

        let body = response.text().await?;
        if !status.is_success() {
            self.gate.report_success();
            let msg = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("msg").and_then(Value::as_str).map(String::from))
                .unwrap_or(body);
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                msg,
            });
        }

        self.gate.report_success();
        serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(e.to_string()))
    }

    async fn symbol_info(&self, symbol: &str) -> SymbolInfo {
        if let Some(info) = self.symbol_info.read().await.get(symbol) {
            return *info;
        }

        match self
            .request(Method::GET, "/fapi/v1/exchangeInfo", Vec::new(), false)
            .await
        {
            Ok(data) => {
                let mut cache = self.symbol_info.write().await;
                for s in data
                    .get("symbols")
                    .and_then(Value::as_array)
                    .unwrap_or(&Vec::new())
                {
                    let Some(sym) = s.get("symbol").and_then(Value::as_str) else {
                        continue;
                    };
                    let mut info = SymbolInfo {
                        quantity_precision: s
                            .get("quantityPrecision")
                            .and_then(Value::as_u64)
                            .unwrap_or(3) as u32,
                        price_precision: s
                            .get("pricePrecision")
                            .and_then(Value::as_u64)
                            .unwrap_or(2) as u32,
                        ..SymbolInfo::default()
                    };
                    for f in s
                        .get("filters")
                        .and_then(Value::as_array)
                        .unwrap_or(&Vec::new())
                    {
                        match f.get("filterType").and_then(Value::as_str) {
                            Some("LOT_SIZE") => {
                                if let Some(step) = parse_f64(f.get("stepSize")) {
                                    info.step_size = step;
                                }
                            }
                            Some("PRICE_FILTER") => {
                                if let Some(tick) = parse_f64(f.get("tickSize")) {
                                    info.tick_size = tick;
                                }
                            }
                            _ => {}
                        }
                    }
                    cache.insert(sym.to_string(), info);
                }
                cache.get(symbol).copied().unwrap_or_default()
            }
            Err(e) => {
                warn!("⚠️ Could not load symbol info for {}: {}", symbol, e);
                SymbolInfo::default()
            }
        }
    }

    /// Round a quantity down to the symbol's lot step and precision.
    async fn round_quantity(&self, symbol: &str, quantity: f64) -> String {
        let info = self.symbol_info(symbol).await;
        round_to_step(quantity, info.step_size, info.quantity_precision)
    }

    /// Round a price to the symbol's tick size and precision.
    async fn round_price(&self, symbol: &str, price: f64) -> String {
        let info = self.symbol_info(symbol).await;
        round_to_step(price, info.tick_size, info.price_precision)
    }
}

fn parse_f64(v: Option<&Value>) -> Option<f64> {
    match v {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    }
}

fn field_f64(v: &Value, key: &str) -> f64 {
    parse_f64(v.get(key)).unwrap_or(0.0)
}

fn field_str(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

/// Snap a value to an exchange step and format with fixed decimal places.
/// Goes through Decimal so "0.1 step" style values do not pick up float dust.
fn round_to_step(value: f64, step: f64, precision: u32) -> String {
    if step <= 0.0 {
        return format!("{value:.prec$}", prec = precision as usize);
    }
    let snapped = (value / step).round() * step;
    match snapped.to_string().parse::<Decimal>() {
        Ok(d) => d.round_dp(precision).normalize().to_string(),
        Err(_) => format!("{snapped:.prec$}", prec = precision as usize),
    }
}

fn order_from_value(v: &Value) -> ExchangeOrder {
    ExchangeOrder {
        id: v
            .get("orderId")
            .map(|id| id.to_string().trim_matches('"').to_string())
            .unwrap_or_default(),
        symbol: field_str(v, "symbol"),
        order_type: field_str(v, "type"),
        side: field_str(v, "side"),
        price: field_f64(v, "price"),
        stop_price: field_f64(v, "stopPrice"),
        amount: field_f64(v, "origQty"),
        reduce_only: v.get("reduceOnly").and_then(Value::as_bool).unwrap_or(false),
        status: field_str(v, "status"),
    }
}

#[async_trait]
impl ExchangeGateway for BinanceGateway {
    async fn get_balance(&self) -> Result<AccountBalance, ExchangeError> {
        let data = self
            .request(Method::GET, "/fapi/v2/account", Vec::new(), true)
            .await?;

        let unrealized_pnl = field_f64(&data, "totalUnrealizedProfit");
        let mut wallet = 0.0;
        let mut available = 0.0;
        for asset in data
            .get("assets")
            .and_then(Value::as_array)
            .unwrap_or(&Vec::new())
        {
            if asset.get("asset").and_then(Value::as_str) == Some("USDT") {
                wallet = field_f64(asset, "walletBalance");
                available = field_f64(asset, "availableBalance");
                break;
            }
        }

        Ok(AccountBalance {
            total_equity: wallet + unrealized_pnl,
            available_margin: available,
            unrealized_pnl,
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let data = self
            .request(Method::GET, "/fapi/v2/account", Vec::new(), true)
            .await?;

        let mut out = Vec::new();
        for p in data
            .get("positions")
            .and_then(Value::as_array)
            .unwrap_or(&Vec::new())
        {
            let amt = field_f64(p, "positionAmt");
            if amt == 0.0 {
                continue;
            }
            out.push(ExchangePosition {
                symbol: field_str(p, "symbol"),
                side: if amt > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                size: amt.abs(),
                entry_price: field_f64(p, "entryPrice"),
                mark_price: field_f64(p, "markPrice"),
                unrealized_pnl: field_f64(p, "unrealizedProfit"),
                leverage: field_f64(p, "leverage").max(1.0),
                margin_mode: field_str(p, "marginType").to_lowercase(),
            });
        }
        Ok(out)
    }

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let mut params = Vec::new();
        if let Some(symbol) = symbol {
            params.push(("symbol", symbol.to_string()));
        }
        let data = self
            .request(Method::GET, "/fapi/v1/openOrders", params, true)
            .await?;

        Ok(data
            .as_array()
            .map(|orders| orders.iter().map(order_from_value).collect())
            .unwrap_or_default())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("interval", timeframe.to_string()),
            ("limit", limit.to_string()),
        ];
        let data = self
            .request(Method::GET, "/fapi/v1/klines", params, false)
            .await?;

        let now_ms = Self::timestamp_ms() as i64;
        let mut bars = Vec::new();
        for row in data.as_array().unwrap_or(&Vec::new()) {
            let Some(cells) = row.as_array() else { continue };
            if cells.len() < 7 {
                continue;
            }
            let open_ms = cells[0].as_i64().unwrap_or(0);
            let close_ms = cells[6].as_i64().unwrap_or(0);
            let open_time = Utc
                .timestamp_millis_opt(open_ms)
                .single()
                .ok_or_else(|| ExchangeError::Parse(format!("bad kline timestamp {open_ms}")))?;
            bars.push(Bar {
                open_time,
                open: parse_f64(Some(&cells[1])).unwrap_or(0.0),
                high: parse_f64(Some(&cells[2])).unwrap_or(0.0),
                low: parse_f64(Some(&cells[3])).unwrap_or(0.0),
                close: parse_f64(Some(&cells[4])).unwrap_or(0.0),
                volume: parse_f64(Some(&cells[5])).unwrap_or(0.0),
                closed: close_ms <= now_ms,
            });
        }
        debug!("📊 Fetched {} {} bars for {}", bars.len(), timeframe, symbol);
        Ok(bars)
    }

    async fn fetch_user_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<FillRecord>, ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("limit", limit.to_string()),
        ];
        let data = self
            .request(Method::GET, "/fapi/v1/userTrades", params, true)
            .await?;

        let mut fills = Vec::new();
        for t in data.as_array().unwrap_or(&Vec::new()) {
            let time_ms = t.get("time").and_then(Value::as_i64).unwrap_or(0);
            fills.push(FillRecord {
                order_id: t
                    .get("orderId")
                    .map(|id| id.to_string().trim_matches('"').to_string())
                    .unwrap_or_default(),
                price: field_f64(t, "price"),
                qty: field_f64(t, "qty"),
                fee: field_f64(t, "commission"),
                time: Utc
                    .timestamp_millis_opt(time_ms)
                    .single()
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(fills)
    }

    async fn fetch_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let data = self
            .request(Method::GET, "/fapi/v1/order", params, true)
            .await?;
        Ok(order_from_value(&data))
    }

    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: Side,
        amount: f64,
        price: Option<f64>,
        opts: OrderOptions,
    ) -> Result<PlacedOrder, ExchangeError> {
        let quantity = self.round_quantity(symbol, amount).await;
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", order_type.as_str().to_string()),
            ("quantity", quantity),
        ];
        if let Some(price) = price {
            params.push(("price", self.round_price(symbol, price).await));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if let Some(stop) = opts.stop_price {
            params.push(("stopPrice", self.round_price(symbol, stop).await));
        }
        if opts.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let data = self
            .request(Method::POST, "/fapi/v1/order", params, true)
            .await?;

        Ok(PlacedOrder {
            id: data
                .get("orderId")
                .map(|id| id.to_string().trim_matches('"').to_string())
                .unwrap_or_default(),
            average_price: field_f64(&data, "avgPrice"),
            status: field_str(&data, "status"),
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        self.request(Method::DELETE, "/fapi/v1/order", params, true)
            .await?;
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        self.request(Method::POST, "/fapi/v1/leverage", params, true)
            .await?;
        info!("⚙️ Leverage set to {}x for {}", leverage, symbol);
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("marginType", mode.to_uppercase()),
        ];
        match self
            .request(Method::POST, "/fapi/v1/marginType", params, true)
            .await
        {
            Ok(_) => {
                info!("⚙️ Margin mode set to {} for {}", mode, symbol);
                Ok(())
            }
            // Binance rejects a no-op change with code -4046.
            Err(ExchangeError::Api { msg, .. }) if msg.contains("No need to change") => Ok(()),
            Err(e) => Err(e),
        }
    }
}
