//! Hourly autonomous sweep per user: temperature upkeep, anomaly
//! detection with auto-trigger synthesis, deferred llm_evaluated trigger
//! verdicts, and stale-signal reconciliation — all captured in a patrol
//! log row.

use chrono::Timelike;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use pulse_core::types::{PatrolKind, Temperature, TriggerKind, TriggerSource};
use pulse_llm::{Message, SystemPrompt};
use pulse_store::types::{NewMessage, NewTrigger, User, UserTrigger};

use crate::error::Result;
use crate::feedback::FeedbackLearner;
use crate::patterns;
use crate::services::Services;
use crate::streams::StreamManager;

/// Inactive users (no activity for a day) are patrolled on even hours
/// only — half cadence, never zero.
const INACTIVE_AFTER_HOURS: i64 = 24;

const EVAL_SYSTEM_PROMPT: &str = "너는 시장 조건 평가 시스템이야. 아래 조건이 현재 충족되었는지 판단해. \
     반드시 첫 줄에 'YES' 또는 'NO'만 출력하고, 그 다음 줄에 간단한 근거를 1~2문장으로 작성해.";

#[derive(Debug, Clone)]
pub struct Anomaly {
    pub kind: String,
    pub symbol: Option<String>,
    pub detail: String,
    pub severity: String,
}

#[derive(Debug, Default)]
pub struct PatrolOutcome {
    pub findings: Vec<Value>,
    pub actions: Vec<Value>,
    pub hot_to_warm: usize,
    pub warm_to_cold: usize,
}

pub struct PatrolService {
    services: Services,
}

impl PatrolService {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Skip rule for the hourly tick.
    pub fn should_skip(&self, user: &User) -> bool {
        let now = self.services.clock.now_utc();
        let Some(last_active) = user.last_active_at else {
            return false;
        };
        let inactive_hours = (now - last_active).num_seconds() as f64 / 3600.0;
        inactive_hours > INACTIVE_AFTER_HOURS as f64 && now.hour() % 2 != 0
    }

    /// One full sweep for one user.
    pub async fn run_patrol(&self, user: &User) -> Result<PatrolOutcome> {
        let mut outcome = PatrolOutcome::default();

        // 1) Temperature upkeep.
        let streams = StreamManager::new(self.services.clone());
        let changes = streams.auto_transition(user.id)?;
        outcome.hot_to_warm = changes.hot_to_warm;
        outcome.warm_to_cold = changes.warm_to_cold;
        if changes.any() {
            outcome.actions.push(json!({
                "type": "temperature_transition",
                "hot_to_warm": changes.hot_to_warm,
                "warm_to_cold": changes.warm_to_cold,
            }));
        }

        // 2) Anomaly scan over hot+warm values.
        let anomalies = self.scan_anomalies(user)?;
        for anomaly in &anomalies {
            outcome.findings.push(json!({
                "type": anomaly.kind,
                "symbol": anomaly.symbol,
                "detail": anomaly.detail,
                "severity": anomaly.severity,
            }));
        }

        // 3) Auto-trigger synthesis for anomalies on the user's symbols.
        let created = self.auto_generate_triggers(user, &anomalies).await?;
        outcome.actions.extend(created);

        // 4) Deferred llm_evaluated trigger verdicts.
        let verdicts = self.evaluate_llm_triggers(user).await?;
        outcome.findings.extend(verdicts);

        // 5) Stale-signal reconciliation.
        let learner = FeedbackLearner::new(self.services.clone());
        if let Err(e) = learner.check_unfollowed(user).await {
            warn!(user_id = user.id, error = %e, "unfollowed check failed");
        }

        // 6) Patrol log.
        let temp_changes = changes.any().then(|| {
            json!({
                "hot_to_warm": changes.hot_to_warm,
                "warm_to_cold": changes.warm_to_cold,
            })
        });
        self.services.store.insert_patrol_log(
            user.id,
            PatrolKind::Scheduled,
            &Value::Array(outcome.findings.clone()),
            &Value::Array(outcome.actions.clone()),
            temp_changes.as_ref(),
            self.services.clock.now_utc(),
        )?;

        info!(
            user_id = user.id,
            findings = outcome.findings.len(),
            actions = outcome.actions.len(),
            "patrol complete"
        );
        Ok(outcome)
    }

    fn scan_anomalies(&self, user: &User) -> Result<Vec<Anomaly>> {
        let streams = self
            .services
            .store
            .user_streams(user.id, &[Temperature::Hot, Temperature::Warm])?;
        Ok(streams
            .iter()
            .filter_map(|s| {
                let value = s.last_value.as_ref()?;
                detect_anomaly(&s.stream_type, s.symbol.as_deref(), value)
            })
            .collect())
    }

    /// Anomaly on a symbol the user actually trades, not already covered
    /// by an active patrol trigger: notify and plant a deferred trigger.
    async fn auto_generate_triggers(
        &self,
        user: &User,
        anomalies: &[Anomaly],
    ) -> Result<Vec<Value>> {
        if anomalies.is_empty() {
            return Ok(Vec::new());
        }

        let primary_symbols = patterns::analyze(&self.services.store, user.id)?.primary_bases();
        let existing = self
            .services
            .store
            .active_patrol_descriptions(user.id)?;

        let mut actions = Vec::new();
        for anomaly in anomalies {
            let Some(symbol) = &anomaly.symbol else {
                continue;
            };
            if !primary_symbols.is_empty() && !primary_symbols.contains(symbol) {
                continue;
            }
            if existing.contains(&anomaly.detail) {
                continue;
            }

            let emoji = if anomaly.severity == "high" { "🚨" } else { "⚡" };
            let text = format!("{emoji} 순찰 감지: {}\n네 관심 종목이라 알려줘.", anomaly.detail);
            let now = self.services.clock.now_utc();
            self.services.store.insert_message(
                user.id,
                &NewMessage::assistant(&text, "patrol_deferred"),
                now,
            )?;
            self.services.store.create_trigger(
                user.id,
                &NewTrigger {
                    kind: Some(TriggerKind::LlmEvaluated),
                    eval_prompt: Some(format!(
                        "{} — 이 상황이 매매 기회인지 위험인지 평가",
                        anomaly.detail
                    )),
                    data_needed: Some(json!(["news", "sentiment"])),
                    description: anomaly.detail.clone(),
                    source: Some(TriggerSource::Patrol),
                    ..Default::default()
                },
                now,
            )?;
            self.services
                .messenger
                .send_text(&user.external_id, &text, None)
                .await;

            actions.push(json!({
                "type": "auto_trigger_created",
                "anomaly": anomaly.kind,
                "symbol": symbol,
                "description": anomaly.detail,
            }));
            info!(user_id = user.id, detail = %anomaly.detail, "patrol auto-trigger created");
        }
        Ok(actions)
    }

    /// Evaluate every active deferred trigger, both patrol-planted and
    /// user-requested. YES retires; NO stays active for the next sweep.
    async fn evaluate_llm_triggers(&self, user: &User) -> Result<Vec<Value>> {
        let triggers = self
            .services
            .store
            .active_triggers(user.id, &[TriggerKind::LlmEvaluated])?;
        if triggers.is_empty() {
            return Ok(Vec::new());
        }

        let mut findings = Vec::new();
        for trigger in triggers {
            let met = match self.evaluate_trigger(user, &trigger).await {
                Ok(met) => met,
                Err(e) => {
                    error!(trigger_id = trigger.id, error = %e, "deferred evaluation failed");
                    continue;
                }
            };
            findings.push(json!({
                "trigger_id": trigger.id,
                "description": trigger.description,
                "condition_met": met,
            }));

            let now = self.services.clock.now_utc();
            if met {
                let text = format!(
                    "🧠 순찰 결과: {}\n조건이 충족된 것으로 판단돼.",
                    trigger.description
                );
                self.services.store.retire_trigger(trigger.id, now)?;
                self.services.store.insert_message(
                    user.id,
                    &NewMessage::assistant(&text, "patrol_deferred"),
                    now,
                )?;
                self.services
                    .messenger
                    .send_text(&user.external_id, &text, None)
                    .await;
            } else {
                // First verdict on a user request gets a status note so
                // the asker knows the watch is active.
                let first_verdict = trigger.triggered_at.is_none();
                self.services.store.mark_triggered(trigger.id, now)?;
                if first_verdict && trigger.source == TriggerSource::UserRequest {
                    let text = format!(
                        "📋 대기 요청 체크: {}\n아직 조건 미충족. 다음 순찰에서 다시 확인할게.",
                        trigger.description
                    );
                    self.services.store.insert_message(
                        user.id,
                        &NewMessage::assistant(&text, "patrol_deferred"),
                        now,
                    )?;
                    self.services
                        .messenger
                        .send_text(&user.external_id, &text, None)
                        .await;
                }
            }
        }
        Ok(findings)
    }

    /// Strict YES/NO verdict over base data plus a prompt-seeded search.
    async fn evaluate_trigger(&self, user: &User, trigger: &UserTrigger) -> Result<bool> {
        let eval_prompt = trigger
            .eval_prompt
            .as_deref()
            .unwrap_or(&trigger.description);

        let mut context_parts = Vec::new();
        let streams = self
            .services
            .store
            .user_streams(user.id, &[Temperature::Hot, Temperature::Warm])?;
        let base_lines: Vec<String> = streams
            .iter()
            .filter(|s| s.last_value.is_some())
            .take(20)
            .map(|s| {
                format!(
                    "- {}: {}",
                    s.data_key(),
                    s.last_value.clone().unwrap_or(Value::Null)
                )
            })
            .collect();
        if !base_lines.is_empty() {
            context_parts.push(format!("## Base 데이터\n{}", base_lines.join("\n")));
        }

        let search_needed = trigger
            .data_needed
            .as_ref()
            .and_then(Value::as_array)
            .map(|needs| {
                needs.iter().filter_map(Value::as_str).any(|need| {
                    matches!(need, "news" | "social" | "sentiment" | "general")
                })
            })
            .unwrap_or(false);
        if search_needed {
            if let Some(results) = self
                .services
                .search
                .search(eval_prompt, &user.language)
                .await
            {
                if results != pulse_sources::search::NO_RESULTS {
                    let clipped: String = results.chars().take(2000).collect();
                    context_parts.push(format!("## 검색 결과\n{clipped}"));
                }
            }
        }

        let context = if context_parts.is_empty() {
            "수집 데이터 없음".to_string()
        } else {
            context_parts.join("\n\n")
        };

        let response = self
            .services
            .llm
            .fast(
                SystemPrompt::plain(EVAL_SYSTEM_PROMPT),
                vec![Message::user(format!(
                    "## 평가할 조건\n{eval_prompt}\n\n## 현재 데이터\n{context}"
                ))],
                200,
            )
            .await?;
        Ok(response.text.trim().to_uppercase().starts_with("YES"))
    }
}

/// Threshold anomaly detection on one stream value.
pub fn detect_anomaly(stream_type: &str, symbol: Option<&str>, value: &Value) -> Option<Anomaly> {
    let symbol_label = symbol.unwrap_or("?");
    match stream_type {
        "price" => {
            let change = value["change_24h_pct"].as_f64()?;
            if change.abs() < 10.0 {
                return None;
            }
            let kind = if change > 0.0 { "price_surge" } else { "price_drop" };
            Some(Anomaly {
                kind: kind.to_string(),
                symbol: symbol.map(String::from),
                detail: format!("{symbol_label} 24h {change:+.1}%"),
                severity: if change.abs() >= 20.0 { "high" } else { "medium" }.to_string(),
            })
        }
        "funding" => {
            let rate = value["rate"].as_f64()?;
            if rate.abs() < 0.05 {
                return None;
            }
            Some(Anomaly {
                kind: "funding_extreme".to_string(),
                symbol: symbol.map(String::from),
                detail: format!("{symbol_label} 펀딩비 {:.2}%", rate * 100.0),
                severity: "high".to_string(),
            })
        }
        "oi" => {
            let change = value["change_pct"].as_f64()?;
            if change.abs() < 15.0 {
                return None;
            }
            Some(Anomaly {
                kind: "oi_surge".to_string(),
                symbol: symbol.map(String::from),
                detail: format!("{symbol_label} OI {change:+.1}%"),
                severity: "medium".to_string(),
            })
        }
        _ => None,
    }
}
