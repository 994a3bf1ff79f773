//! The judge: a deep-model verdict over the collected data, persisted as
//! a Signal and delivered with the feedback surface. Enforces the daily
//! signal quota before doing any paid work.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info};

use pulse_core::types::Direction;
use pulse_llm::extract::{parse_judge_response, JudgeVerdict};
use pulse_llm::{Message, SystemPrompt};
use pulse_store::types::{EpisodeDraft, NewMessage, NewSignal, Signal, User, UserTrigger};

use crate::collector::{format_collected, SignalCollector};
use crate::context;
use crate::error::Result;
use crate::messenger::signal_feedback_keyboard;
use crate::services::Services;

const JUDGE_MAX_TOKENS: u32 = 2048;

const JUDGE_INSTRUCTIONS: &str = "너는 유저의 투자 분신이야. 유저의 스타일과 원칙으로 시장을 판단해.\n\
     반드시 ```json 블록 하나로 응답해:\n\
     {\"kind\": \"trade_signal|briefing\", \"direction\": \"long|short|exit|watch\",\n\
     \"reasoning\": \"...\", \"counter_argument\": \"...\",\n\
     \"confidence\": {\"style_match\": 0.0, \"historical_similar\": 0.0, \"market_context\": 0.0},\n\
     \"stop_loss\": \"...\"}";

pub struct SignalPipeline {
    services: Services,
}

impl SignalPipeline {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Full pipeline for a fired signal trigger: quota → collect → judge
    /// → persist → deliver. Returns the created signal, or `None` when
    /// the quota blocked the run or the model was unavailable.
    pub async fn run(&self, user: &User, trigger: &UserTrigger) -> Result<Option<Signal>> {
        let now = self.services.clock.now_utc();

        if !self.check_signal_quota(user, now)? {
            let limit = self.services.monitor.daily_signal_limit;
            self.services
                .messenger
                .send_text(
                    &user.external_id,
                    &format!("오늘 시그널 {limit}회 다 썼어. 내일 리셋!"),
                    None,
                )
                .await;
            info!(user_id = user.id, "daily signal quota reached");
            return Ok(None);
        }

        let collector = SignalCollector::new(self.services.clone());
        let collected = collector.collect_deep(user, trigger).await?;
        let symbol = collected.symbol.clone().unwrap_or_else(|| "UNKNOWN".to_string());

        let intel = context::build_intelligence_context(&self.services, user, &trigger.description)
            .await?;
        let system = SystemPrompt::new(
            format!(
                "{JUDGE_INSTRUCTIONS}\n\n## Intelligence\n{}\n\n## 원칙\n{}",
                intel.stable, intel.principles
            ),
            format!(
                "## 보유 포지션\n{}\n\n## 수집 데이터\n{}",
                intel.positions,
                format_collected(&collected)
            ),
        );
        let prompt = format!(
            "트리거 발동: {}\n\n수집 데이터 기반으로 판단해줘.",
            trigger.description
        );

        let response = match self
            .services
            .llm
            .deep(system, vec![Message::user(prompt)], JUDGE_MAX_TOKENS)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(trigger_id = trigger.id, error = %e, "judge model call failed");
                return Ok(None);
            }
        };
        info!(
            input_tokens = response.usage.input_tokens,
            cache_read = response.usage.cache_read,
            output_tokens = response.usage.output_tokens,
            "judge responded"
        );

        let verdict = parse_judge_response(&response.text);

        let signal = self.services.store.insert_signal(
            user.id,
            &NewSignal {
                kind: Some(verdict.kind),
                content: verdict.content.clone(),
                reasoning: verdict.reasoning.clone(),
                counter_argument: verdict.counter_argument.clone(),
                confidence: verdict.confidence,
                confidence_style: verdict.confidence_style,
                confidence_history: verdict.confidence_history,
                confidence_market: verdict.confidence_market,
                symbol: Some(symbol.clone()),
                direction: Some(verdict.direction),
                stop_loss: verdict.stop_loss.clone(),
            },
            now,
        )?;

        let fresh = self.services.store.user(user.id)?;
        self.services.store.set_daily_signal(
            user.id,
            fresh.daily_signal_count + 1,
            fresh.daily_signal_reset_at.or(Some(now)),
        )?;

        let text = format_signal_message(&verdict, &symbol);
        self.services.store.insert_message(
            user.id,
            &NewMessage {
                role: pulse_core::types::MessageRole::Assistant,
                content: text.clone(),
                intent: Some("signal_trigger".to_string()),
                metadata: Some(json!({"signal_id": signal.id})),
            },
            now,
        )?;

        if let Some(chart) = &collected.chart_image {
            self.services
                .messenger
                .send_photo(&user.external_id, chart, Some(&format!("📸 {symbol} 차트")))
                .await;
        }
        self.services
            .messenger
            .send_text(&user.external_id, &text, Some(&signal_feedback_keyboard()))
            .await;

        context::create_episode(
            &self.services,
            user,
            {
                let mut draft = EpisodeDraft::new(
                    pulse_core::types::EpisodeKind::Signal,
                    format!("시그널: {symbol} {}", verdict.direction),
                    format!(
                        "{symbol} {}",
                        verdict.reasoning.chars().take(300).collect::<String>()
                    ),
                );
                draft.reasoning = Some(verdict.reasoning.clone());
                draft
            },
            true,
        )
        .await?;

        // The trigger is consumed only once the pipeline succeeded.
        self.services.store.retire_trigger(trigger.id, now)?;

        info!(
            user_id = user.id,
            signal_id = signal.id,
            %symbol,
            direction = %verdict.direction,
            confidence = verdict.confidence,
            "signal created"
        );
        Ok(Some(signal))
    }

    /// Reset the counter when the UTC day rolled over, then check the
    /// budget. Mutates the stored reset timestamp as a side effect.
    fn check_signal_quota(&self, user: &User, now: DateTime<Utc>) -> Result<bool> {
        let fresh = self.services.store.user(user.id)?;
        let count = match fresh.daily_signal_reset_at {
            Some(reset_at) if reset_at.date_naive() < now.date_naive() => {
                self.services.store.set_daily_signal(user.id, 0, Some(now))?;
                0
            }
            Some(_) => fresh.daily_signal_count,
            None => {
                self.services
                    .store
                    .set_daily_signal(user.id, fresh.daily_signal_count, Some(now))?;
                fresh.daily_signal_count
            }
        };
        Ok(count < self.services.monitor.daily_signal_limit)
    }
}

fn confidence_bar(label: &str, value: f64) -> String {
    let filled = (value * 10.0).round().clamp(0.0, 10.0) as usize;
    format!(
        "  {label}  {}{}  {:.0}%",
        "█".repeat(filled),
        "░".repeat(10 - filled),
        value * 100.0
    )
}

/// Signal message with the three-axis confidence bars.
fn format_signal_message(verdict: &JudgeVerdict, symbol: &str) -> String {
    let direction_label = match verdict.direction {
        Direction::Long => "🟢 롱",
        Direction::Short => "🔴 숏",
        Direction::Exit => "🚪 청산",
        Direction::Watch => "👀 관망",
    };

    let mut lines = vec![format!("🎯 {symbol} {direction_label} 상황"), String::new()];
    let reasoning: String = verdict.reasoning.chars().take(800).collect();
    lines.push(format!("📊 판단 근거:\n{reasoning}"));

    let counter = verdict
        .counter_argument
        .clone()
        .unwrap_or_else(|| "반대 시나리오도 항상 존재해. 리스크 관리 필수.".to_string());
    let counter: String = counter.chars().take(400).collect();
    lines.push(format!("\n⚠️ 반대 근거:\n{counter}"));

    lines.push(format!("\n📍 확신도: {:.0}%", verdict.confidence * 100.0));
    if let (Some(style), Some(history), Some(market)) = (
        verdict.confidence_style,
        verdict.confidence_history,
        verdict.confidence_market,
    ) {
        lines.push(confidence_bar("스타일 매칭", style));
        lines.push(confidence_bar("유사 과거 ", history));
        lines.push(confidence_bar("시장 맥락 ", market));
    }

    if let Some(stop) = &verdict.stop_loss {
        lines.push(format!("\n🛑 손절: {stop}"));
    }

    lines.push("\n어떻게 생각해?".to_string());
    lines.push("\n⚠️ 매매를 대행하지 않습니다. 최종 판단은 본인의 몫입니다.".to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::types::SignalKind;

    fn verdict() -> JudgeVerdict {
        JudgeVerdict {
            kind: SignalKind::TradeSignal,
            direction: Direction::Long,
            reasoning: "거래대금 우위".to_string(),
            counter_argument: Some("단기 과열".to_string()),
            confidence: 0.71,
            confidence_style: Some(0.7),
            confidence_history: Some(0.6),
            confidence_market: Some(0.8),
            stop_loss: Some("145".to_string()),
            content: "본문".to_string(),
        }
    }

    #[test]
    fn message_contains_axes_and_stop() {
        let text = format_signal_message(&verdict(), "SOL");
        assert!(text.contains("🎯 SOL 🟢 롱 상황"));
        assert!(text.contains("확신도: 71%"));
        assert!(text.contains("스타일 매칭"));
        assert!(text.contains("🛑 손절: 145"));
    }

    #[test]
    fn message_without_axes_skips_bars() {
        let mut v = verdict();
        v.confidence_style = None;
        v.confidence_history = None;
        v.confidence_market = None;
        let text = format_signal_message(&v, "SOL");
        assert!(!text.contains("스타일 매칭"));
        assert!(text.contains("확신도: 71%"));
    }

    #[test]
    fn bar_rendering() {
        assert_eq!(confidence_bar("x", 0.7), "  x  ███████░░░  70%");
        assert_eq!(confidence_bar("x", 0.0), "  x  ░░░░░░░░░░  0%");
        assert_eq!(confidence_bar("x", 1.0), "  x  ██████████  100%");
    }
}
