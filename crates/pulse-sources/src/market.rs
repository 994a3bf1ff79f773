//! Public market data fetchers for the stream pollers.
//!
//! No user exchange keys involved: Binance public endpoints for price,
//! funding, and open interest; CryptoPanic for headlines; alternative.me
//! for the fear & greed index; Upbit + Binance + a USD/KRW rate for the
//! Korea premium spread.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, SourceError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// USD/KRW rate is re-fetched after this many seconds.
const KRW_RATE_TTL_SECS: i64 = 1800;
const KRW_RATE_FALLBACK: f64 = 1350.0;

/// Fetch one value for a `(stream_type, symbol)` pair.
///
/// Returns `None` on any failure — the stream is not marked stale, the
/// next poll cycle simply retries.
#[async_trait]
pub trait MarketSource: Send + Sync {
    async fn fetch(
        &self,
        stream_type: &str,
        symbol: Option<&str>,
        config: Option<&Value>,
    ) -> Option<Value>;
}

pub struct HttpMarketSource {
    http: reqwest::Client,
    cryptopanic_key: Option<String>,
    krw_rate: Mutex<(f64, i64)>,
}

impl HttpMarketSource {
    pub fn new(cryptopanic_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            cryptopanic_key,
            krw_rate: Mutex::new((0.0, 0)),
        }
    }

    async fn fetch_price(&self, symbol: &str) -> Result<Value> {
        let pair = format!("{}USDT", symbol.to_uppercase());
        let url = format!("https://api.binance.com/api/v3/ticker/24hr?symbol={pair}");
        let body: Value = self.http.get(&url).send().await?.json().await?;
        Ok(json!({
            "last": num(&body["lastPrice"]),
            "high_24h": num(&body["highPrice"]),
            "low_24h": num(&body["lowPrice"]),
            "volume_24h": num(&body["quoteVolume"]),
            "change_24h_pct": num(&body["priceChangePercent"]),
            "volume_ratio": Value::Null,
        }))
    }

    async fn fetch_funding(&self, symbol: &str) -> Result<Value> {
        let pair = format!("{}USDT", symbol.to_uppercase());
        let url = format!("https://fapi.binance.com/fapi/v1/fundingRate?symbol={pair}&limit=1");
        let body: Value = self.http.get(&url).send().await?.json().await?;
        let latest = body
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| SourceError::Parse("empty funding history".to_string()))?;
        let rate = num(&latest["fundingRate"]);
        Ok(json!({
            "rate": rate,
            "rate_pct": rate * 100.0,
            "ts": latest["fundingTime"],
        }))
    }

    async fn fetch_oi(&self, symbol: &str) -> Result<Value> {
        let pair = format!("{}USDT", symbol.to_uppercase());
        let url = format!("https://fapi.binance.com/fapi/v1/openInterest?symbol={pair}");
        let body: Value = self.http.get(&url).send().await?.json().await?;
        Ok(json!({
            "open_interest": num(&body["openInterest"]),
            // Filled by the poller from the previous observation.
            "change_pct": Value::Null,
        }))
    }

    async fn fetch_news(&self) -> Result<Value> {
        let Some(key) = &self.cryptopanic_key else {
            return Ok(json!({"headlines": [], "count": 0, "source": "cryptopanic"}));
        };
        let url = format!(
            "https://cryptopanic.com/api/free/v1/posts/?auth_token={key}&kind=news&filter=hot&public=true"
        );
        let body: Value = self.http.get(&url).send().await?.json().await?;
        let headlines: Vec<Value> = body["results"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .take(10)
                    .filter_map(|r| r["title"].as_str())
                    .map(|t| Value::String(t.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(json!({
            "count": headlines.len(),
            "headlines": headlines,
            "source": "cryptopanic",
        }))
    }

    async fn fetch_fear_greed(&self) -> Result<Value> {
        let body: Value = self
            .http
            .get("https://api.alternative.me/fng/?limit=1")
            .send()
            .await?
            .json()
            .await?;
        let entry = body["data"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| SourceError::Parse("empty fear & greed response".to_string()))?;
        Ok(json!({
            "value": num(&entry["value"]) as i64,
            "classification": entry["value_classification"].as_str().unwrap_or("Neutral"),
            "ts": entry["timestamp"],
        }))
    }

    /// Korea premium: Upbit KRW price vs Binance USD price at the current
    /// USD/KRW rate.
    async fn fetch_kimchi_spread(&self) -> Result<Value> {
        let upbit: Value = self
            .http
            .get("https://api.upbit.com/v1/ticker?markets=KRW-BTC")
            .send()
            .await?
            .json()
            .await?;
        let upbit_price = upbit
            .as_array()
            .and_then(|arr| arr.first())
            .map(|t| num(&t["trade_price"]))
            .unwrap_or(0.0);

        let binance: Value = self
            .http
            .get("https://api.binance.com/api/v3/ticker/price?symbol=BTCUSDT")
            .send()
            .await?
            .json()
            .await?;
        let binance_price = num(&binance["price"]);

        let usd_krw = self.usd_krw_rate().await;

        if upbit_price <= 0.0 || binance_price <= 0.0 || usd_krw <= 0.0 {
            return Err(SourceError::Parse("incomplete spread legs".to_string()));
        }
        let premium = upbit_price / (binance_price * usd_krw) - 1.0;
        Ok(json!({
            "premium_pct": (premium * 10000.0).round() / 100.0,
            "legs": {
                "upbit_btc_krw": upbit_price,
                "binance_btc_usd": binance_price,
                "usd_krw": usd_krw,
            },
        }))
    }

    async fn usd_krw_rate(&self) -> f64 {
        {
            let cached = self.krw_rate.lock().unwrap();
            if cached.0 > 0.0 && Utc::now().timestamp() - cached.1 < KRW_RATE_TTL_SECS {
                return cached.0;
            }
        }
        let fetched = async {
            let body: Value = self
                .http
                .get("https://api.exchangerate-api.com/v4/latest/USD")
                .send()
                .await?
                .json()
                .await?;
            Ok::<f64, SourceError>(num(&body["rates"]["KRW"]))
        }
        .await;
        match fetched {
            Ok(rate) if rate > 0.0 => {
                *self.krw_rate.lock().unwrap() = (rate, Utc::now().timestamp());
                rate
            }
            _ => {
                debug!("USD/KRW rate fetch failed, using fallback");
                let cached = self.krw_rate.lock().unwrap();
                if cached.0 > 0.0 {
                    cached.0
                } else {
                    KRW_RATE_FALLBACK
                }
            }
        }
    }
}

#[async_trait]
impl MarketSource for HttpMarketSource {
    async fn fetch(
        &self,
        stream_type: &str,
        symbol: Option<&str>,
        _config: Option<&Value>,
    ) -> Option<Value> {
        let result = match stream_type {
            "price" => self.fetch_price(symbol.unwrap_or("BTC")).await,
            "funding" => self.fetch_funding(symbol.unwrap_or("BTC")).await,
            "oi" => self.fetch_oi(symbol.unwrap_or("BTC")).await,
            "news" => self.fetch_news().await,
            "indicator" if symbol == Some("fear_greed") => self.fetch_fear_greed().await,
            "spread" if symbol == Some("kimchi") => self.fetch_kimchi_spread().await,
            _ => return None,
        };
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(stream_type, ?symbol, error = %e, "stream fetch failed");
                None
            }
        }
    }
}

/// Numeric field that vendor APIs return as either a number or a string.
pub(crate) fn num(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_handles_vendor_string_numbers() {
        assert_eq!(num(&json!("123.5")), 123.5);
        assert_eq!(num(&json!(123.5)), 123.5);
        assert_eq!(num(&json!(null)), 0.0);
        assert_eq!(num(&json!("not a number")), 0.0);
    }

    #[tokio::test]
    async fn unknown_stream_type_is_none() {
        let source = HttpMarketSource::new(None);
        assert!(source.fetch("volume_ranking", Some("upbit"), None).await.is_none());
        assert!(source.fetch("indicator", Some("unknown"), None).await.is_none());
    }
}
