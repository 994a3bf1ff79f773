//! Cost-tiered data collection for a fired signal trigger.
//!
//! Tier 1 is the user's own stream data (free), tier 2 external APIs,
//! tier 3 bilingual web search, tier 4 chart capture. Collection stops
//! as soon as the gathered set is sufficient for the judge.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::info;

use pulse_core::types::Temperature;
use pulse_store::types::{User, UserTrigger};

use crate::error::Result;
use crate::services::Services;
use crate::trigger::Condition;

/// What the collector hands to the judge.
#[derive(Debug, Clone)]
pub struct CollectedData {
    pub symbol: Option<String>,
    pub base_data: Value,
    pub api_data: Value,
    pub search_data: Option<String>,
    pub chart_image: Option<Vec<u8>>,
    pub sufficient_at_tier: u8,
}

pub struct SignalCollector {
    services: Services,
}

impl SignalCollector {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn collect_deep(&self, user: &User, trigger: &UserTrigger) -> Result<CollectedData> {
        let symbol = extract_symbol(trigger);

        // Tier 1: base data, always included.
        let base_data = self.collect_base(user, symbol.as_deref())?;
        let has_price = !base_data["price"].is_null();
        let has_derivatives = !base_data["funding"].is_null() || !base_data["oi"].is_null();

        // Tier 2: external APIs keyed by symbol.
        let api_data = self.collect_api(symbol.as_deref()).await;
        let has_news = api_data["news"]
            .as_object()
            .map(|news| news.get("count").and_then(Value::as_i64).unwrap_or(0) > 0)
            .unwrap_or(false);

        let mut collected = CollectedData {
            symbol: symbol.clone(),
            base_data,
            api_data,
            search_data: None,
            chart_image: None,
            sufficient_at_tier: 2,
        };

        if has_price && has_derivatives && has_news {
            info!(?symbol, tier = 2, "collection sufficient");
            return Ok(collected);
        }

        // Tier 3: bilingual web search.
        if let Some(symbol) = &symbol {
            collected.search_data = self
                .services
                .search
                .search(&format!("{symbol} crypto analysis latest news"), &user.language)
                .await;
            collected.sufficient_at_tier = 3;
        }

        // Tier 4: chart capture, only when the trigger asked for it.
        let chart_needed = trigger
            .condition
            .as_ref()
            .and_then(|raw| Condition::parse(raw).ok())
            .map(|c| c.chart_needed)
            .unwrap_or(false);
        if chart_needed {
            if let Some(symbol) = &symbol {
                if let Some(image) = self.services.chart.capture(symbol).await {
                    collected.chart_image = Some(image);
                    collected.sufficient_at_tier = 4;
                }
            }
        }

        info!(?symbol, tier = collected.sufficient_at_tier, "collection complete");
        Ok(collected)
    }

    /// Hot and warm stream values relevant to the symbol, BTC/ETH market
    /// context always included, plus the user's open positions.
    fn collect_base(&self, user: &User, symbol: Option<&str>) -> Result<Value> {
        let streams = self
            .services
            .store
            .user_streams(user.id, &[Temperature::Hot, Temperature::Warm])?;

        let mut data = Map::new();
        for stream in streams {
            let Some(value) = stream.last_value else {
                continue;
            };
            let relevant = match (&stream.symbol, symbol) {
                (None, _) => true,
                (Some(stream_symbol), Some(symbol)) => stream_symbol
                    .to_uppercase()
                    .contains(&symbol.to_uppercase()),
                (Some(_), None) => false,
            };
            if relevant {
                data.insert(stream.stream_type.clone(), value);
            } else if matches!(stream.symbol.as_deref(), Some("BTC") | Some("ETH")) {
                data.insert(
                    format!("{}_{}", stream.stream_type, stream.symbol.as_deref().unwrap()),
                    value,
                );
            }
        }

        let open_trades = self.services.store.open_trades(user.id)?;
        if !open_trades.is_empty() {
            let positions: Vec<Value> = open_trades
                .iter()
                .map(|t| {
                    json!({
                        "symbol": t.symbol,
                        "side": t.side.to_string(),
                        "entry_price": t.entry_price,
                        "leverage": t.leverage,
                    })
                })
                .collect();
            data.insert("positions".to_string(), Value::Array(positions));
        }

        Ok(Value::Object(data))
    }

    /// Quote and headlines for the symbol from the market source.
    async fn collect_api(&self, symbol: Option<&str>) -> Value {
        let mut data = Map::new();
        if let Some(symbol) = symbol {
            if let Some(quote) = self.services.market.fetch("price", Some(symbol), None).await {
                data.insert("quote".to_string(), quote);
            }
        }
        if let Some(news) = self.services.market.fetch("news", None, None).await {
            data.insert("news".to_string(), news);
        }
        Value::Object(data)
    }
}

/// Symbol from the trigger condition, falling back to an uppercase token
/// in the description.
pub fn extract_symbol(trigger: &UserTrigger) -> Option<String> {
    if let Some(condition) = &trigger.condition {
        if let Some(symbol) = condition["symbol"].as_str() {
            return Some(symbol.to_string());
        }
    }

    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\b([A-Z]{2,6})\b").expect("symbol regex"));
    let noise: HashSet<&str> = ["THE", "AND", "FOR", "BUY", "SELL"].into();
    re.captures_iter(&trigger.description)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .find(|s| !noise.contains(s.as_str()))
}

/// Render the collected record into prompt text for the judge.
pub fn format_collected(collected: &CollectedData) -> String {
    let mut parts = Vec::new();

    if let Some(base) = collected.base_data.as_object() {
        if !base.is_empty() {
            let lines: Vec<String> = base
                .iter()
                .take(15)
                .map(|(k, v)| format!("- {k}: {}", clip(&v.to_string(), 300)))
                .collect();
            parts.push(format!("## Base 데이터\n{}", lines.join("\n")));
        }
    }
    if let Some(api) = collected.api_data.as_object() {
        if !api.is_empty() {
            let lines: Vec<String> = api
                .iter()
                .take(10)
                .map(|(k, v)| format!("- {k}: {}", clip(&v.to_string(), 300)))
                .collect();
            parts.push(format!("## 외부 API\n{}", lines.join("\n")));
        }
    }
    if let Some(search) = &collected.search_data {
        parts.push(format!("## 웹 검색\n{}", clip(search, 1500)));
    }

    if parts.is_empty() {
        "수집 데이터 없음".to_string()
    } else {
        parts.join("\n\n")
    }
}

fn clip(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
