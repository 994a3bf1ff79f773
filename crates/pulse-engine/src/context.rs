//! Episode creation and the intelligence context injected into every
//! model call.
//!
//! Episode rows are durable first; the vector upsert is best-effort and
//! its id is recorded by a follow-up update. A vector outage therefore
//! never loses an episode and never fails the surrounding operation.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{info, warn};

use pulse_core::types::Temperature;
use pulse_store::types::{EpisodeDraft, User};

use crate::error::Result;
use crate::patterns;
use crate::services::Services;

/// Create an episode, optionally auto-collecting market context, and
/// upsert its embedding into the user's vector namespace.
pub async fn create_episode(
    services: &Services,
    user: &User,
    mut draft: EpisodeDraft,
    auto_collect_market: bool,
) -> Result<i64> {
    if auto_collect_market && draft.market_context.is_none() {
        draft.market_context = Some(collect_market_context(services, user)?);
    }

    let now = services.clock.now_utc();
    let episode_id = services.store.insert_episode(user.id, &draft, now)?;
    info!(
        user_id = user.id,
        episode_id,
        kind = %draft.kind,
        "episode created"
    );

    // Best-effort vector upsert; the row above is already committed.
    let namespace = pulse_vector::namespace(&user.external_id);
    let metadata = json!({ "kind": draft.kind.to_string() });
    match services
        .vector
        .upsert(&namespace, episode_id, &draft.embedding_text, &metadata)
        .await
    {
        Ok(vector_id) => {
            services.store.set_episode_vector_id(episode_id, &vector_id)?;
        }
        Err(e) => {
            warn!(episode_id, error = %e, "vector upsert failed, episode kept in store only");
        }
    }

    Ok(episode_id)
}

/// Similar episode ids for a query text. Failures yield an empty list.
pub async fn similar_episodes(
    services: &Services,
    user: &User,
    query: &str,
    top_k: usize,
) -> Vec<i64> {
    let namespace = pulse_vector::namespace(&user.external_id);
    match services.vector.query(&namespace, query, top_k).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(user_id = user.id, error = %e, "similar episode lookup failed");
            Vec::new()
        }
    }
}

/// Market situation snapshot stored alongside trade/signal episodes:
/// hot+warm stream values plus open positions.
pub fn collect_market_context(services: &Services, user: &User) -> Result<Value> {
    let mut context = serde_json::Map::new();

    let streams = services
        .store
        .user_streams(user.id, &[Temperature::Hot, Temperature::Warm])?;
    let base: Vec<Value> = streams
        .iter()
        .map(|s| {
            json!({
                "type": s.stream_type,
                "symbol": s.symbol,
                "temp": s.temperature.to_string(),
                "value": s.last_value,
            })
        })
        .collect();
    if !base.is_empty() {
        context.insert("base_streams".to_string(), Value::Array(base));
    }

    let open_trades = services.store.open_trades(user.id)?;
    if !open_trades.is_empty() {
        let positions: Vec<Value> = open_trades
            .iter()
            .map(|t| {
                json!({
                    "symbol": t.symbol,
                    "side": t.side.to_string(),
                    "entry_price": t.entry_price,
                    "leverage": t.leverage,
                    "exchange": t.exchange,
                })
            })
            .collect();
        context.insert("open_positions".to_string(), Value::Array(positions));
    }

    Ok(Value::Object(context))
}

/// Named sections for prompt assembly. `stable` changes only as the user
/// learns (cacheable); the rest is per-call.
#[derive(Debug, Clone, Default)]
pub struct IntelligenceContext {
    pub stable: String,
    pub principles: String,
    pub base_data: String,
    pub positions: String,
    pub recent_chat: String,
}

/// Build the context injected into judge, reasoning, and briefing calls.
pub async fn build_intelligence_context(
    services: &Services,
    user: &User,
    current_message: &str,
) -> Result<IntelligenceContext> {
    let store = &services.store;
    let mut stable_parts: Vec<String> = Vec::new();

    // Profile.
    let mut profile = vec![
        format!("언어: {}", user.language),
        format!("티어: {}", user.tier),
    ];
    let style = style_context(services, user)?;
    if !style.is_empty() {
        profile.push(style);
    }
    stable_parts.push(format!("### 프로필\n{}", profile.join("\n")));

    // Principles (also returned as a section of their own).
    let principles_list = store.active_principles(user.id)?;
    let principles = if principles_list.is_empty() {
        "설정된 원칙 없음".to_string()
    } else {
        principles_list
            .iter()
            .enumerate()
            .map(|(i, p)| format!("{}. {}", i + 1, p.content))
            .collect::<Vec<_>>()
            .join("\n")
    };

    // Learned trading patterns.
    let pattern_stats = patterns::analyze(store, user.id)?;
    let patterns_text = patterns::format_context(&pattern_stats);
    if patterns_text != "매매 이력 없음" {
        stable_parts.push(format!("### 매매 패턴\n{patterns_text}"));
    }

    // Expression calibration.
    let calibration = calibration_context(services, user.id)?;
    if !calibration.is_empty() {
        stable_parts.push(format!("### 표현 캘리브레이션\n{calibration}"));
    }

    // Recent episodes, enriched with vector-similar ones.
    let recent = store.recent_episodes(user.id, 5)?;
    let mut episode_lines: Vec<String> = recent
        .iter()
        .map(|ep| {
            format!(
                "- [{}] {} (근거: {})",
                ep.kind,
                ep.user_action,
                ep.reasoning.as_deref().unwrap_or("없음")
            )
        })
        .collect();
    if !current_message.is_empty() {
        let recent_ids: Vec<i64> = recent.iter().map(|ep| ep.id).collect();
        let similar_ids: Vec<i64> = similar_episodes(services, user, current_message, 3)
            .await
            .into_iter()
            .filter(|id| !recent_ids.contains(id))
            .collect();
        for ep in store.episodes_by_ids(&similar_ids)? {
            episode_lines.push(format!("- [유사/{}] {}", ep.kind, ep.user_action));
        }
    }
    stable_parts.push(format!(
        "### 에피소드\n{}",
        if episode_lines.is_empty() {
            "에피소드 없음".to_string()
        } else {
            episode_lines.join("\n")
        }
    ));

    // Recent signals with their feedback.
    let recent_signals = store.recent_signals(user.id, 5)?;
    if !recent_signals.is_empty() {
        let lines: Vec<String> = recent_signals
            .iter()
            .map(|sig| {
                let feedback = if let Some(text) = &sig.user_feedback {
                    format!(" (피드백: {text})")
                } else {
                    match sig.user_agreed {
                        Some(true) => " (동의)".to_string(),
                        Some(false) => " (반대)".to_string(),
                        None => String::new(),
                    }
                };
                let preview: String = sig.content.chars().take(100).collect();
                format!("- {}: {preview}{feedback}", sig.kind)
            })
            .collect();
        stable_parts.push(format!("### 최근 시그널\n{}", lines.join("\n")));
    }

    // Open positions.
    let open_trades = store.open_trades(user.id)?;
    let positions = if open_trades.is_empty() {
        "보유 포지션 없음".to_string()
    } else {
        open_trades
            .iter()
            .map(|t| format!("- {} {} @ {} (x{})", t.symbol, t.side, t.entry_price, t.leverage))
            .collect::<Vec<_>>()
            .join("\n")
    };

    // Hot stream values.
    let hot_streams = store.user_streams(user.id, &[Temperature::Hot])?;
    let base_data = if hot_streams.is_empty() {
        "실시간 데이터 없음".to_string()
    } else {
        hot_streams
            .iter()
            .map(|s| {
                format!(
                    "- {}: {}",
                    s.data_key(),
                    s.last_value.clone().unwrap_or(Value::Null)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    // Recent conversation.
    let messages = store.recent_messages(user.id, 10)?;
    let recent_chat = if messages.is_empty() {
        "대화 기록 없음".to_string()
    } else {
        messages
            .iter()
            .map(|m| {
                let who = match m.role {
                    pulse_core::types::MessageRole::User => "유저",
                    _ => "FORKER",
                };
                let preview: String = m.content.chars().take(200).collect();
                format!("{who}: {preview}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    Ok(IntelligenceContext {
        stable: stable_parts.join("\n\n"),
        principles,
        base_data,
        positions,
        recent_chat,
    })
}

/// Merge calibration entries from episodes, newest first, first writer
/// wins per expression.
pub fn calibration_map(services: &Services, user_id: i64) -> Result<HashMap<String, Value>> {
    let episodes = services.store.calibration_episodes(user_id)?;
    let mut map = HashMap::new();
    for ep in episodes {
        let Some(cal) = ep.expression_calibration else {
            continue;
        };
        let (Some(expression), Some(value)) = (cal["expression"].as_str(), cal.get("actual_value"))
        else {
            continue;
        };
        map.entry(expression.to_string())
            .or_insert_with(|| value.clone());
    }
    Ok(map)
}

fn calibration_context(services: &Services, user_id: i64) -> Result<String> {
    let map = calibration_map(services, user_id)?;
    let mut lines: Vec<String> = map
        .iter()
        .map(|(expression, value)| match value.as_f64() {
            Some(n) if n > 0.0 => format!("\"{expression}\" = +{n}%"),
            Some(n) => format!("\"{expression}\" = {n}%"),
            None => format!("\"{expression}\" = {value}"),
        })
        .collect();
    lines.sort();
    Ok(lines.join("\n"))
}

/// Style tags aggregated from recent episodes.
fn style_context(services: &Services, user: &User) -> Result<String> {
    let mut tag_counts: HashMap<String, usize> = HashMap::new();
    for ep in services.store.recent_episodes(user.id, 20)? {
        let Some(tags) = ep.style_tags.and_then(|v| v.as_object().cloned()) else {
            continue;
        };
        for (key, value) in tags {
            *tag_counts.entry(format!("{key}={value}")).or_default() += 1;
        }
    }
    if tag_counts.is_empty() {
        return Ok(String::new());
    }
    let mut top: Vec<(String, usize)> = tag_counts.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top.truncate(5);
    Ok(format!(
        "스타일 태그: {}",
        top.iter()
            .map(|(tag, count)| format!("{tag}({count}회)"))
            .collect::<Vec<_>>()
            .join(", ")
    ))
}
