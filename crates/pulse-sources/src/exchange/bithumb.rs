//! Bithumb client: spot-only KRW venue with the HMAC-SHA512 form API.
//! Positions are synthesised from balances.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha512;
use tracing::debug;

use super::{api_error, synthetic_spot_positions, ExchangeSource, OrderRecord, PositionRecord, Ticker};
use crate::error::{Result, SourceError};
use crate::market::num;

const BASE: &str = "https://api.bithumb.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BithumbSource {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
}

impl BithumbSource {
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

    /// Api-Sign: base64(hmac_sha512(endpoint \0 query \0 nonce)).
    fn sign(&self, endpoint: &str, query: &str, nonce: &str) -> String {
        let payload = format!("{endpoint}\0{query}\0{nonce}");
        let mut mac = Hmac::<Sha512>::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(hex::encode(mac.finalize().into_bytes()))
    }

    async fn private_post(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Value> {
        let mut pairs: Vec<String> = vec![format!("endpoint={endpoint}")];
        for (k, v) in params {
            pairs.push(format!("{k}={v}"));
        }
        let query = pairs.join("&");
        let nonce = Utc::now().timestamp_millis().to_string();
        let signature = self.sign(endpoint, &query, &nonce);

        let resp = self
            .http
            .post(format!("{BASE}{endpoint}"))
            .header("Api-Key", &self.api_key)
            .header("Api-Sign", signature)
            .header("Api-Nonce", &nonce)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(query)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(api_error(status, &body, &[&self.api_key, &self.api_secret]));
        }
        let body: Value = resp.json().await?;
        if body["status"].as_str() != Some("0000") {
            let message = body["message"].as_str().unwrap_or("unknown vendor error");
            return Err(api_error(
                200,
                message,
                &[&self.api_key, &self.api_secret],
            ));
        }
        Ok(body)
    }
}

#[async_trait]
impl ExchangeSource for BithumbSource {
    fn name(&self) -> &str {
        "bithumb"
    }

    async fn list_orders_since(&self, since_ms: i64) -> Result<Vec<OrderRecord>> {
        // One transaction query per held asset; search 0 = all operations,
        // rows carry their own type markers for the transfer filter.
        let balances = self.fetch_balances().await?;
        let mut orders = Vec::new();

        for asset in balances.keys() {
            if asset == "KRW" {
                continue;
            }
            let body = match self
                .private_post(
                    "/info/user_transactions",
                    &[("order_currency", asset), ("payment_currency", "KRW"), ("count", "50")],
                )
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    debug!(asset, error = %e, "user_transactions query failed");
                    continue;
                }
            };
            let Some(rows) = body["data"].as_array() else {
                continue;
            };
            for row in rows {
                // search 1 = buy, 2 = sell; other values are transfers etc.
                let search = row["search"].as_str().unwrap_or("");
                let side = match search {
                    "1" => "buy",
                    "2" => "sell",
                    _ => continue,
                };
                // transfer_date is microseconds.
                let ts = num(&row["transfer_date"]) as i64 / 1000;
                if ts < since_ms {
                    continue;
                }
                orders.push(OrderRecord {
                    symbol: format!("{asset}/KRW"),
                    side: side.to_string(),
                    amount: num(&row["units"]).abs(),
                    cost: num(&row["price"]) * num(&row["units"]).abs(),
                    timestamp_ms: ts,
                    status: "closed".to_string(),
                    raw: row.clone(),
                });
            }
        }
        orders.sort_by_key(|o| o.timestamp_ms);
        Ok(orders)
    }

    async fn fetch_balances(&self) -> Result<HashMap<String, f64>> {
        let body = self
            .private_post("/info/balance", &[("currency", "ALL")])
            .await?;
        let data = body["data"]
            .as_object()
            .ok_or_else(|| SourceError::Parse("balance data is not an object".to_string()))?;

        let mut balances = HashMap::new();
        for (key, value) in data {
            if let Some(asset) = key.strip_prefix("total_") {
                let amount = num(value);
                if amount > 0.0 {
                    balances.insert(asset.to_uppercase(), amount);
                }
            }
        }
        Ok(balances)
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionRecord>> {
        let balances = self.fetch_balances().await?;
        Ok(synthetic_spot_positions(&balances, "KRW"))
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let pair = symbol.replace('/', "_");
        let url = format!("{BASE}/public/ticker/{pair}");
        let body: Value = self.http.get(&url).send().await?.json().await?;
        let last = num(&body["data"]["closing_price"]);
        if last <= 0.0 {
            return Err(SourceError::Parse(format!("no price for {symbol}")));
        }
        Ok(Ticker { last })
    }
}
