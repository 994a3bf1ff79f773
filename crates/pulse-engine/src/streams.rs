//! Base stream lifecycle: preset creation, temperature transitions,
//! value updates with hot caching, and the per-user hot snapshot the
//! trigger engine consumes.
//!
//! Temperature policy: hot streams poll every few seconds and are
//! cached; warm streams poll slowly; cold streams are only touched by
//! patrol. Streams are never deleted — a re-mention restores them hot.

use std::collections::HashMap;

use chrono::Duration;
use serde_json::Value;
use tracing::{debug, info};

use pulse_core::config::HOT_CACHE_TTL_SECS;
use pulse_core::types::Temperature;
use pulse_store::types::{BaseStream, User};

use crate::error::Result;
use crate::services::Services;

/// The default hot set created once a user finishes onboarding.
const DEFAULT_PRESET: [(&str, Option<&str>, &str); 9] = [
    ("price", Some("BTC"), "binance"),
    ("price", Some("ETH"), "binance"),
    ("funding", Some("BTC"), "binance"),
    ("funding", Some("ETH"), "binance"),
    ("oi", Some("BTC"), "binance"),
    ("oi", Some("ETH"), "binance"),
    ("news", None, "cryptopanic"),
    ("indicator", Some("fear_greed"), "alternative"),
    ("spread", Some("kimchi"), "upbit_binance"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemperatureChanges {
    pub hot_to_warm: usize,
    pub warm_to_cold: usize,
}

impl TemperatureChanges {
    pub fn any(&self) -> bool {
        self.hot_to_warm > 0 || self.warm_to_cold > 0
    }
}

pub struct StreamManager {
    services: Services,
}

impl StreamManager {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Create the default preset idempotently. Returns how many streams
    /// were newly created; existing ones are left untouched.
    pub fn create_default_preset(&self, user: &User) -> Result<usize> {
        let now = self.services.clock.now_utc();
        let existing: Vec<(String, Option<String>)> = self
            .services
            .store
            .user_streams(
                user.id,
                &[Temperature::Hot, Temperature::Warm, Temperature::Cold],
            )?
            .into_iter()
            .map(|s| (s.stream_type, s.symbol))
            .collect();

        let mut created = 0;
        for (stream_type, symbol, source) in DEFAULT_PRESET {
            let key = (stream_type.to_string(), symbol.map(String::from));
            if existing.contains(&key) {
                continue;
            }
            let config = serde_json::json!({ "source": source });
            self.services
                .store
                .upsert_stream(user.id, stream_type, symbol, Some(&config), now)?;
            created += 1;
        }
        if created > 0 {
            info!(user_id = user.id, created, "default stream preset created");
        }
        Ok(created)
    }

    /// A symbol was mentioned: restore its streams to hot.
    pub fn touch(&self, user_id: i64, symbol: &str) -> Result<usize> {
        let now = self.services.clock.now_utc();
        let promoted = self.services.store.touch_streams(user_id, symbol, now)?;
        if promoted > 0 {
            debug!(user_id, symbol, promoted, "streams restored to hot");
        }
        Ok(promoted)
    }

    /// Time-based demotion, driven by the hourly temperature job.
    pub fn auto_transition(&self, user_id: i64) -> Result<TemperatureChanges> {
        let now = self.services.clock.now_utc();
        let hot_cutoff = now - Duration::days(self.services.monitor.hot_threshold_days);
        let warm_cutoff = now - Duration::days(self.services.monitor.warm_threshold_days);

        // Hot→warm first: a stream idle past the warm threshold then
        // falls straight through to cold in the same pass.
        let hot_to_warm = self.services.store.transition_temperatures(
            user_id,
            Temperature::Hot,
            Temperature::Warm,
            hot_cutoff,
        )?;
        let warm_to_cold = self.services.store.transition_temperatures(
            user_id,
            Temperature::Warm,
            Temperature::Cold,
            warm_cutoff,
        )?;

        let changes = TemperatureChanges {
            hot_to_warm,
            warm_to_cold,
        };
        if changes.any() {
            info!(
                user_id,
                hot_to_warm = changes.hot_to_warm,
                warm_to_cold = changes.warm_to_cold,
                "temperature transition"
            );
        }
        Ok(changes)
    }

    /// Persist a fresh observation. Hot streams also refresh the cache so
    /// the next snapshot sees the new value immediately.
    pub async fn set_value(&self, stream: &BaseStream, value: &Value) -> Result<()> {
        self.services.store.set_stream_value(stream.id, value)?;
        if stream.temperature == Temperature::Hot {
            let key = pulse_cache::stream_key(
                stream.user_id,
                &stream.stream_type,
                stream.symbol.as_deref(),
            );
            self.services.cache.set(&key, value, HOT_CACHE_TTL_SECS).await;
        }
        Ok(())
    }

    /// Merged view of the user's hot streams: cache hit preferred, stored
    /// last value as fallback, absent otherwise. Sole trigger-engine input.
    pub async fn hot_snapshot(&self, user_id: i64) -> Result<HashMap<String, Value>> {
        let streams = self
            .services
            .store
            .user_streams(user_id, &[Temperature::Hot])?;

        let mut snapshot = HashMap::with_capacity(streams.len());
        for stream in streams {
            let key =
                pulse_cache::stream_key(user_id, &stream.stream_type, stream.symbol.as_deref());
            if let Some(cached) = self.services.cache.get(&key).await {
                snapshot.insert(stream.data_key(), cached);
            } else if let Some(value) = stream.last_value.clone() {
                snapshot.insert(stream.data_key(), value);
            }
        }
        Ok(snapshot)
    }

    /// One global poll pass over every stream of the given temperature.
    /// Market data is not per-user, so each distinct `(type, symbol)` is
    /// fetched once and fanned out to all subscribers. Returns the number
    /// of streams updated.
    pub async fn poll_temperature(&self, temperature: Temperature) -> Result<usize> {
        let streams = self.services.store.streams_by_temperature(temperature)?;
        if streams.is_empty() {
            return Ok(0);
        }

        // Group subscribers by the market quantity they share.
        let mut groups: HashMap<(String, Option<String>), Vec<BaseStream>> = HashMap::new();
        for stream in streams {
            groups
                .entry((stream.stream_type.clone(), stream.symbol.clone()))
                .or_default()
                .push(stream);
        }

        let mut updated = 0;
        for ((stream_type, symbol), subscribers) in groups {
            let fetched = self
                .services
                .market
                .fetch(&stream_type, symbol.as_deref(), None)
                .await;
            let Some(value) = fetched else {
                // Fetch failure is not staleness; the next cycle retries.
                continue;
            };
            for stream in subscribers {
                let enriched = enrich_value(&stream, &value);
                self.set_value(&stream, &enriched).await?;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

/// Derive observation-over-observation fields the raw fetch cannot know.
/// Open interest gets its change percentage from the previous value.
fn enrich_value(stream: &BaseStream, value: &Value) -> Value {
    if stream.stream_type != "oi" {
        return value.clone();
    }
    let new_oi = value["open_interest"].as_f64().unwrap_or(0.0);
    let prev_oi = stream
        .last_value
        .as_ref()
        .and_then(|v| v["open_interest"].as_f64())
        .unwrap_or(0.0);
    let mut enriched = value.clone();
    if prev_oi > 0.0 && new_oi > 0.0 {
        let change_pct = (new_oi - prev_oi) / prev_oi * 100.0;
        enriched["change_pct"] = serde_json::json!(change_pct);
    }
    enriched
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn oi_change_derived_from_previous_value() {
        let stream = BaseStream {
            id: 1,
            user_id: 1,
            stream_type: "oi".to_string(),
            symbol: Some("BTC".to_string()),
            config: json!({}),
            temperature: Temperature::Hot,
            last_mentioned_at: chrono::Utc::now(),
            last_value: Some(json!({"open_interest": 100.0, "change_pct": null})),
        };
        let fresh = json!({"open_interest": 115.0, "change_pct": null});
        let enriched = enrich_value(&stream, &fresh);
        assert!((enriched["change_pct"].as_f64().unwrap() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn first_oi_observation_has_no_change() {
        let stream = BaseStream {
            id: 1,
            user_id: 1,
            stream_type: "oi".to_string(),
            symbol: Some("BTC".to_string()),
            config: json!({}),
            temperature: Temperature::Hot,
            last_mentioned_at: chrono::Utc::now(),
            last_value: None,
        };
        let fresh = json!({"open_interest": 115.0, "change_pct": null});
        let enriched = enrich_value(&stream, &fresh);
        assert!(enriched["change_pct"].is_null());
    }

    #[test]
    fn non_oi_values_pass_through() {
        let stream = BaseStream {
            id: 1,
            user_id: 1,
            stream_type: "price".to_string(),
            symbol: Some("BTC".to_string()),
            config: json!({}),
            temperature: Temperature::Hot,
            last_mentioned_at: chrono::Utc::now(),
            last_value: Some(json!({"last": 1.0})),
        };
        let fresh = json!({"last": 2.0});
        assert_eq!(enrich_value(&stream, &fresh), fresh);
    }
}
