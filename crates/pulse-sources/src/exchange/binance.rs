//! Binance client: HMAC-SHA256 signed spot REST plus the futures position
//! endpoint.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use super::{api_error, ExchangeSource, OrderRecord, PositionRecord, Ticker};
use crate::error::{Result, SourceError};
use crate::market::num;

const SPOT_BASE: &str = "https://api.binance.com";
const FUTURES_BASE: &str = "https://fapi.binance.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BinanceSource {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
}

impl BinanceSource {
    pub fn new(api_key: &str, api_secret: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_get(&self, base: &str, path: &str, query: &str) -> Result<Value> {
        let timestamp = Utc::now().timestamp_millis();
        let full_query = if query.is_empty() {
            format!("timestamp={timestamp}")
        } else {
            format!("{query}&timestamp={timestamp}")
        };
        let signature = self.sign(&full_query);
        let url = format!("{base}{path}?{full_query}&signature={signature}");

        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(api_error(status, &body, &[&self.api_key, &self.api_secret]));
        }
        Ok(resp.json().await?)
    }

    /// "SOLUSDT" → "SOL/USDT".
    fn split_pair(pair: &str) -> String {
        for quote in ["USDT", "BUSD", "BTC", "ETH"] {
            if let Some(base) = pair.strip_suffix(quote) {
                if !base.is_empty() {
                    return format!("{base}/{quote}");
                }
            }
        }
        pair.to_string()
    }
}

#[async_trait]
impl ExchangeSource for BinanceSource {
    fn name(&self) -> &str {
        "binance"
    }

    async fn list_orders_since(&self, since_ms: i64) -> Result<Vec<OrderRecord>> {
        // Instruments the account touched: every non-quote asset it holds,
        // paired against USDT. One myTrades query per instrument.
        let balances = self.fetch_balances().await?;
        let mut orders = Vec::new();

        for asset in balances.keys() {
            if matches!(asset.as_str(), "USDT" | "BUSD") {
                continue;
            }
            let pair = format!("{asset}USDT");
            let query = format!("symbol={pair}&startTime={since_ms}&limit=100");
            let fills = match self.signed_get(SPOT_BASE, "/api/v3/myTrades", &query).await {
                Ok(Value::Array(fills)) => fills,
                Ok(_) => continue,
                Err(e) => {
                    // Unlisted pair or no history; the sweep continues.
                    debug!(pair, error = %e, "myTrades query failed");
                    continue;
                }
            };
            for fill in fills {
                let ts = fill["time"].as_i64().unwrap_or(0);
                if ts < since_ms {
                    continue;
                }
                orders.push(OrderRecord {
                    symbol: Self::split_pair(fill["symbol"].as_str().unwrap_or(&pair)),
                    side: if fill["isBuyer"].as_bool().unwrap_or(false) {
                        "buy".to_string()
                    } else {
                        "sell".to_string()
                    },
                    amount: num(&fill["qty"]),
                    cost: num(&fill["quoteQty"]),
                    timestamp_ms: ts,
                    status: "closed".to_string(),
                    raw: fill,
                });
            }
        }
        orders.sort_by_key(|o| o.timestamp_ms);
        Ok(orders)
    }

    async fn fetch_balances(&self) -> Result<HashMap<String, f64>> {
        let body = self.signed_get(SPOT_BASE, "/api/v3/account", "").await?;
        let mut balances = HashMap::new();
        if let Some(rows) = body["balances"].as_array() {
            for row in rows {
                let amount = num(&row["free"]) + num(&row["locked"]);
                if amount > 0.0 {
                    if let Some(asset) = row["asset"].as_str() {
                        balances.insert(asset.to_string(), amount);
                    }
                }
            }
        }
        Ok(balances)
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionRecord>> {
        let body = self
            .signed_get(FUTURES_BASE, "/fapi/v2/positionRisk", "")
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| SourceError::Parse("positionRisk is not an array".to_string()))?;

        let mut positions = Vec::new();
        for row in rows {
            let amt = num(&row["positionAmt"]);
            if amt == 0.0 {
                continue;
            }
            positions.push(PositionRecord {
                symbol: Self::split_pair(row["symbol"].as_str().unwrap_or("")),
                side: if amt > 0.0 { "long" } else { "short" }.to_string(),
                size: amt.abs(),
                entry_price: Some(num(&row["entryPrice"])),
                unrealized_pnl: Some(num(&row["unRealizedProfit"])),
                leverage: num(&row["leverage"]).max(1.0),
            });
        }
        Ok(positions)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let pair = symbol.replace('/', "");
        let url = format!("{SPOT_BASE}/api/v3/ticker/price?symbol={pair}");
        let body: Value = self.http.get(&url).send().await?.json().await?;
        let last = num(&body["price"]);
        if last <= 0.0 {
            return Err(SourceError::Parse(format!("no price for {symbol}")));
        }
        Ok(Ticker { last })
    }
}
