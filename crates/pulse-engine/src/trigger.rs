//! Three-tier trigger evaluation against the hot snapshot.
//!
//! Alerts and signals are matched here in pure code on every hot cycle;
//! llm_evaluated triggers are patrol's job and are never fired here.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info};

use pulse_core::types::TriggerKind;
use pulse_store::types::{NewMessage, User, UserTrigger};

use crate::error::{EngineError, Result};
use crate::judge::SignalPipeline;
use crate::services::Services;

/// Leaf condition grammar. Unknown tags fail deserialization and are
/// treated as a contract violation by the caller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Leaf {
    PriceAbove { symbol: String, value: f64 },
    PriceBelow { symbol: String, value: f64 },
    FundingAbove { symbol: String, value: f64 },
    FundingBelow { symbol: String, value: f64 },
    VolumeSpike { symbol: String, value: f64 },
    OiChange { symbol: String, value: f64 },
    KimchiPremium { value: f64 },
    NewsKeyword { keyword: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub leaf: Leaf,
    /// Requests the collector's chart tier when the trigger fires.
    pub chart_needed: bool,
}

impl Condition {
    pub fn parse(raw: &Value) -> Result<Condition> {
        let leaf: Leaf = serde_json::from_value(raw.clone())
            .map_err(|e| EngineError::Contract(format!("bad trigger condition: {e}")))?;
        Ok(Condition {
            leaf,
            chart_needed: raw["chart_needed"].as_bool().unwrap_or(false),
        })
    }

    pub fn symbol(&self) -> Option<&str> {
        match &self.leaf {
            Leaf::PriceAbove { symbol, .. }
            | Leaf::PriceBelow { symbol, .. }
            | Leaf::FundingAbove { symbol, .. }
            | Leaf::FundingBelow { symbol, .. }
            | Leaf::VolumeSpike { symbol, .. }
            | Leaf::OiChange { symbol, .. } => Some(symbol),
            Leaf::KimchiPremium { .. } | Leaf::NewsKeyword { .. } => None,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match &self.leaf {
            Leaf::PriceAbove { value, .. }
            | Leaf::PriceBelow { value, .. }
            | Leaf::FundingAbove { value, .. }
            | Leaf::FundingBelow { value, .. }
            | Leaf::VolumeSpike { value, .. }
            | Leaf::OiChange { value, .. }
            | Leaf::KimchiPremium { value } => Some(*value),
            Leaf::NewsKeyword { .. } => None,
        }
    }

    /// Human label for alert texts.
    pub fn label(&self) -> &'static str {
        match &self.leaf {
            Leaf::PriceAbove { .. } => "가격 도달",
            Leaf::PriceBelow { .. } => "가격 이하",
            Leaf::FundingAbove { .. } => "펀딩비 이상",
            Leaf::FundingBelow { .. } => "펀딩비 이하",
            Leaf::VolumeSpike { .. } => "거래대금 급증",
            Leaf::OiChange { .. } => "OI 변화",
            Leaf::KimchiPremium { .. } => "김프 도달",
            Leaf::NewsKeyword { .. } => "뉴스 키워드",
        }
    }

    /// Match against the hot snapshot. Missing or non-numeric data is a
    /// plain non-match, never an error.
    pub fn matches(&self, snapshot: &HashMap<String, Value>) -> bool {
        match &self.leaf {
            Leaf::PriceAbove { symbol, value } => {
                number_at(snapshot, &format!("price/{symbol}"), "last")
                    .is_some_and(|last| last >= *value)
            }
            Leaf::PriceBelow { symbol, value } => {
                number_at(snapshot, &format!("price/{symbol}"), "last")
                    .is_some_and(|last| last <= *value)
            }
            Leaf::FundingAbove { symbol, value } => {
                number_at(snapshot, &format!("funding/{symbol}"), "rate")
                    .is_some_and(|rate| rate >= *value)
            }
            Leaf::FundingBelow { symbol, value } => {
                number_at(snapshot, &format!("funding/{symbol}"), "rate")
                    .is_some_and(|rate| rate <= *value)
            }
            Leaf::VolumeSpike { symbol, value } => {
                number_at(snapshot, &format!("price/{symbol}"), "volume_ratio")
                    .is_some_and(|ratio| ratio >= *value)
            }
            Leaf::OiChange { symbol, value } => {
                number_at(snapshot, &format!("oi/{symbol}"), "change_pct")
                    .is_some_and(|change| change.abs() >= *value)
            }
            Leaf::KimchiPremium { value } => {
                number_at(snapshot, "spread/kimchi", "premium_pct")
                    .is_some_and(|premium| premium >= *value)
            }
            Leaf::NewsKeyword { keyword } => {
                let needle = keyword.to_lowercase();
                snapshot
                    .get("news/all")
                    .and_then(|v| v["headlines"].as_array())
                    .is_some_and(|headlines| {
                        headlines
                            .iter()
                            .filter_map(Value::as_str)
                            .any(|h| h.to_lowercase().contains(&needle))
                    })
            }
        }
    }
}

fn number_at(snapshot: &HashMap<String, Value>, key: &str, field: &str) -> Option<f64> {
    let value = snapshot.get(key)?;
    match &value[field] {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Bind `{stream_type}_{field} = number` variables from the streams a
/// composite trigger declared it needs.
pub fn bind_variables(
    streams_needed: &Value,
    snapshot: &HashMap<String, Value>,
) -> HashMap<String, f64> {
    let mut variables = HashMap::new();
    let Some(entries) = streams_needed.as_array() else {
        return variables;
    };
    for entry in entries {
        let Some(stream_type) = entry["stream_type"].as_str() else {
            continue;
        };
        let key_symbol = entry["symbol"]
            .as_str()
            .or_else(|| entry["source"].as_str())
            .unwrap_or("all");
        let Some(data) = snapshot.get(&format!("{stream_type}/{key_symbol}")) else {
            continue;
        };
        let Some(fields) = data.as_object() else {
            continue;
        };
        for (field, value) in fields {
            let number = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            };
            if let Some(number) = number {
                variables.insert(format!("{stream_type}_{field}"), number);
            }
        }
    }
    variables
}

/// Evaluate the minimal comparison grammar `<lhs> <op> <rhs>` over bound
/// names. Anything else — unknown op, missing binding, wrong arity — is
/// a non-match. No untrusted code is ever evaluated.
pub fn eval_composite(logic: &str, variables: &HashMap<String, f64>) -> bool {
    let parts: Vec<&str> = logic.split_whitespace().collect();
    let [lhs, op, rhs] = parts.as_slice() else {
        return false;
    };
    let (Some(left), Some(right)) = (variables.get(*lhs), variables.get(*rhs)) else {
        return false;
    };
    match *op {
        ">" => left > right,
        "<" => left < right,
        ">=" => left >= right,
        "<=" => left <= right,
        "==" => left == right,
        _ => false,
    }
}

fn trigger_matches(trigger: &UserTrigger, snapshot: &HashMap<String, Value>) -> Result<bool> {
    if let Some(raw) = &trigger.condition {
        if raw.is_object() && !raw["type"].is_null() {
            return Ok(Condition::parse(raw)?.matches(snapshot));
        }
    }
    if let Some(logic) = &trigger.composite_logic {
        let needed = trigger
            .base_streams_needed
            .clone()
            .unwrap_or(Value::Array(Vec::new()));
        let variables = bind_variables(&needed, snapshot);
        if variables.is_empty() {
            return Ok(false);
        }
        return Ok(eval_composite(logic, &variables));
    }
    Ok(false)
}

pub struct TriggerEngine {
    services: Services,
}

impl TriggerEngine {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Match the user's active alert and signal triggers against the hot
    /// snapshot, firing each match. Returns the number fired. A broken
    /// trigger aborts only itself; the sweep continues.
    pub async fn evaluate_all(
        &self,
        user: &User,
        snapshot: &HashMap<String, Value>,
    ) -> Result<usize> {
        let triggers = self
            .services
            .store
            .active_triggers(user.id, &[TriggerKind::Alert, TriggerKind::Signal])?;
        if triggers.is_empty() {
            return Ok(0);
        }

        let mut fired = 0;
        for trigger in triggers {
            let matched = match trigger_matches(&trigger, snapshot) {
                Ok(matched) => matched,
                Err(e) => {
                    error!(trigger_id = trigger.id, error = %e, "trigger evaluation failed");
                    continue;
                }
            };
            if !matched {
                continue;
            }
            let outcome = match trigger.kind {
                TriggerKind::Alert => self.fire_alert(user, &trigger).await,
                TriggerKind::Signal => self.fire_signal(user, &trigger).await,
                TriggerKind::LlmEvaluated => continue,
            };
            match outcome {
                Ok(()) => fired += 1,
                Err(e) => {
                    error!(trigger_id = trigger.id, error = %e, "trigger firing failed")
                }
            }
        }
        Ok(fired)
    }

    /// One-shot alert: message out, trigger retired.
    async fn fire_alert(&self, user: &User, trigger: &UserTrigger) -> Result<()> {
        let now = self.services.clock.now_utc();
        let condition = trigger.condition.as_ref().and_then(|raw| Condition::parse(raw).ok());

        let text = match condition
            .as_ref()
            .and_then(|c| c.symbol().map(|s| (s.to_string(), c.value(), c.label())))
        {
            Some((symbol, Some(value), label)) => {
                format!("🔔 {symbol} {label} ({value})\n{}", trigger.description)
            }
            _ => format!("🔔 알림: {}", trigger.description),
        };

        self.services.store.retire_trigger(trigger.id, now)?;
        self.services
            .store
            .insert_message(user.id, &NewMessage::assistant(&text, "alert"), now)?;
        self.services
            .messenger
            .send_text(&user.external_id, &text, None)
            .await;

        info!(trigger_id = trigger.id, user_id = user.id, "alert fired");
        Ok(())
    }

    /// Signal trigger: interim note, then the collector→judge pipeline.
    /// The trigger stays active until the pipeline completes.
    async fn fire_signal(&self, user: &User, trigger: &UserTrigger) -> Result<()> {
        let now = self.services.clock.now_utc();
        self.services.store.mark_triggered(trigger.id, now)?;

        let text = format!("🎯 시그널 감지: {}\n분석 중...", trigger.description);
        self.services
            .store
            .insert_message(user.id, &NewMessage::assistant(&text, "signal_trigger"), now)?;
        self.services
            .messenger
            .send_text(&user.external_id, &text, None)
            .await;

        info!(trigger_id = trigger.id, user_id = user.id, "signal trigger fired");

        let pipeline = SignalPipeline::new(self.services.clone());
        match pipeline.run(user, trigger).await {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(trigger_id = trigger.id, error = %e, "signal pipeline failed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn price_above_fires_at_threshold() {
        let cond = Condition::parse(&json!({
            "type": "price_above", "symbol": "BTC", "value": 100000.0
        }))
        .unwrap();
        let snap = snapshot(&[("price/BTC", json!({"last": 100000.0}))]);
        assert!(cond.matches(&snap));

        let below = snapshot(&[("price/BTC", json!({"last": 99999.9}))]);
        assert!(!cond.matches(&below));
    }

    #[test]
    fn missing_or_non_numeric_data_never_matches() {
        let cond = Condition::parse(&json!({
            "type": "price_above", "symbol": "BTC", "value": 1.0
        }))
        .unwrap();
        assert!(!cond.matches(&snapshot(&[])));
        assert!(!cond.matches(&snapshot(&[("price/BTC", json!({"last": "n/a"}))])));
        // Vendor string-numbers still count.
        assert!(cond.matches(&snapshot(&[("price/BTC", json!({"last": "2.5"}))])));
    }

    #[test]
    fn oi_change_uses_magnitude() {
        let cond = Condition::parse(&json!({
            "type": "oi_change", "symbol": "ETH", "value": 15.0
        }))
        .unwrap();
        assert!(cond.matches(&snapshot(&[("oi/ETH", json!({"change_pct": -16.0}))])));
        assert!(cond.matches(&snapshot(&[("oi/ETH", json!({"change_pct": 15.0}))])));
        assert!(!cond.matches(&snapshot(&[("oi/ETH", json!({"change_pct": 10.0}))])));
    }

    #[test]
    fn news_keyword_is_case_insensitive() {
        let cond = Condition::parse(&json!({
            "type": "news_keyword", "keyword": "etf"
        }))
        .unwrap();
        let snap = snapshot(&[(
            "news/all",
            json!({"headlines": ["Spot ETF Inflows Surge", "other"]}),
        )]);
        assert!(cond.matches(&snap));
        assert!(!cond.matches(&snapshot(&[("news/all", json!({"headlines": ["nothing"]}))])));
    }

    #[test]
    fn kimchi_premium_threshold() {
        let cond = Condition::parse(&json!({"type": "kimchi_premium", "value": 3.0})).unwrap();
        assert!(cond.matches(&snapshot(&[("spread/kimchi", json!({"premium_pct": 3.4}))])));
        assert!(!cond.matches(&snapshot(&[("spread/kimchi", json!({"premium_pct": 2.9}))])));
    }

    #[test]
    fn unknown_condition_tag_is_contract_error() {
        let parsed = Condition::parse(&json!({"type": "moon_phase", "value": 1.0}));
        assert!(matches!(parsed, Err(EngineError::Contract(_))));
    }

    #[test]
    fn chart_needed_flag_is_read() {
        let cond = Condition::parse(&json!({
            "type": "price_above", "symbol": "SOL", "value": 1.0, "chart_needed": true
        }))
        .unwrap();
        assert!(cond.chart_needed);
    }

    #[test]
    fn composite_binding_flattens_stream_fields() {
        let needed = json!([{"stream_type": "volume_ranking", "source": "upbit"}]);
        let snap = snapshot(&[(
            "volume_ranking/upbit",
            json!({"top3_volume": 5.0e12, "btc_volume": 3.0e12}),
        )]);
        let vars = bind_variables(&needed, &snap);
        assert_eq!(vars["volume_ranking_top3_volume"], 5.0e12);
        assert_eq!(vars["volume_ranking_btc_volume"], 3.0e12);

        assert!(eval_composite(
            "volume_ranking_top3_volume > volume_ranking_btc_volume",
            &vars
        ));
        assert!(!eval_composite(
            "volume_ranking_top3_volume < volume_ranking_btc_volume",
            &vars
        ));
    }

    #[test]
    fn composite_missing_binding_is_non_match() {
        let vars = HashMap::from([("a".to_string(), 1.0)]);
        assert!(!eval_composite("a > b", &vars));
        assert!(!eval_composite("a >", &vars));
        assert!(!eval_composite("a ?? a", &vars));
    }
}
