//! Credentialed exchange access behind one narrow trait.
//!
//! Each venue client normalises its order history, balances, positions,
//! and tickers into the shared records below. Spot-only venues derive
//! synthetic long-only positions from their non-quote balances.

mod binance;
mod bithumb;
mod upbit;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

pub use binance::BinanceSource;
pub use bithumb::BithumbSource;
pub use upbit::UpbitSource;

use pulse_core::cipher::Cipher;

use crate::error::{Result, SourceError};

/// One filled order, normalised across venues.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    /// Unified pair form, e.g. "SOL/USDT" or "XRP/KRW".
    pub symbol: String,
    /// "buy" | "sell".
    pub side: String,
    pub amount: f64,
    /// Quote notional of the fill.
    pub cost: f64,
    pub timestamp_ms: i64,
    pub status: String,
    /// Vendor payload, kept for transfer-type detection.
    pub raw: Value,
}

impl OrderRecord {
    /// Explicit transfer rows never count as trades.
    pub fn is_transfer(&self) -> bool {
        let kind = self.raw["type"]
            .as_str()
            .or_else(|| self.raw["info"]["type"].as_str())
            .unwrap_or("");
        matches!(kind.to_lowercase().as_str(), "deposit" | "withdrawal" | "transfer")
    }
}

#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub symbol: String,
    /// "long" | "short".
    pub side: String,
    pub size: f64,
    pub entry_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub leverage: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    pub last: f64,
}

/// Capability surface the trade detector consumes per connection.
#[async_trait]
pub trait ExchangeSource: Send + Sync {
    fn name(&self) -> &str;

    /// Filled orders across every instrument the account touched since
    /// `since_ms`, normalised.
    async fn list_orders_since(&self, since_ms: i64) -> Result<Vec<OrderRecord>>;

    /// Positive balances only, `{asset → amount}`.
    async fn fetch_balances(&self) -> Result<HashMap<String, f64>>;

    /// Open derivatives positions, or synthetic spot positions on venues
    /// without derivatives.
    async fn fetch_positions(&self) -> Result<Vec<PositionRecord>>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;
}

/// Build a venue client from plaintext credentials.
pub fn connect(exchange: &str, api_key: &str, api_secret: &str) -> Result<Box<dyn ExchangeSource>> {
    match exchange {
        "binance" => Ok(Box::new(BinanceSource::new(api_key, api_secret))),
        "upbit" => Ok(Box::new(UpbitSource::new(api_key, api_secret))),
        "bithumb" => Ok(Box::new(BithumbSource::new(api_key, api_secret))),
        other => Err(SourceError::UnsupportedExchange(other.to_string())),
    }
}

/// Connection factory the engine depends on. The trait boundary keeps the
/// detector testable with scripted exchanges.
pub trait ExchangeConnector: Send + Sync {
    /// Decrypt the stored credentials and build a client. Plaintext is
    /// confined to this call and dropped before it returns.
    fn connect(
        &self,
        exchange: &str,
        api_key_enc: &[u8],
        api_secret_enc: &[u8],
    ) -> Result<Box<dyn ExchangeSource>>;
}

pub struct RestExchangeConnector {
    cipher: Cipher,
}

impl RestExchangeConnector {
    pub fn new(cipher: Cipher) -> Self {
        Self { cipher }
    }
}

impl ExchangeConnector for RestExchangeConnector {
    fn connect(
        &self,
        exchange: &str,
        api_key_enc: &[u8],
        api_secret_enc: &[u8],
    ) -> Result<Box<dyn ExchangeSource>> {
        let api_key = self
            .cipher
            .decrypt(api_key_enc)
            .map_err(|_| SourceError::Auth("credential decryption failed".to_string()))?;
        let api_secret = self
            .cipher
            .decrypt(api_secret_enc)
            .map_err(|_| SourceError::Auth("credential decryption failed".to_string()))?;
        let source = connect(exchange, &api_key, &api_secret);
        drop(api_key);
        drop(api_secret);
        source
    }
}

/// Spot venues have no position endpoint: every non-quote balance is a
/// synthetic long with unknown entry.
pub(crate) fn synthetic_spot_positions(
    balances: &HashMap<String, f64>,
    quote: &str,
) -> Vec<PositionRecord> {
    let skip = ["KRW", "USDT", "BUSD", "BTC"];
    let mut positions: Vec<PositionRecord> = balances
        .iter()
        .filter(|(asset, amount)| **amount > 0.0 && !skip.contains(&asset.as_str()))
        .map(|(asset, amount)| PositionRecord {
            symbol: format!("{asset}/{quote}"),
            side: "long".to_string(),
            size: *amount,
            entry_price: None,
            unrealized_pnl: None,
            leverage: 1.0,
        })
        .collect();
    positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    positions
}

/// Redact both credentials from a vendor error body before it can reach
/// logs or error chains.
pub(crate) fn api_error(status: u16, body: &str, secrets: &[&str]) -> SourceError {
    SourceError::Api {
        status,
        message: pulse_core::cipher::redact(body, secrets),
    }
}
