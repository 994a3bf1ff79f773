//! Feedback loop: user reactions to signals and realised trade outcomes
//! become episodes and update the signal rows they belong to.

use chrono::Duration;
use serde_json::json;
use tracing::{debug, info};

use pulse_core::types::{Direction, EpisodeKind, TradeSide};
use pulse_store::types::{EpisodeDraft, Signal, Trade, User};

use crate::context;
use crate::error::Result;
use crate::services::Services;

/// Signals older than this with no trade are recorded as unfollowed.
const UNFOLLOWED_AFTER_HOURS: i64 = 24;
/// A linked trade must open within [signal − 24 h, signal + 1 h]
/// — equivalently, the signal lies in [open − 24 h, open + 1 h].
const LINK_BEFORE_OPEN_HOURS: i64 = 24;
const LINK_AFTER_OPEN_HOURS: i64 = 1;

pub struct FeedbackLearner {
    services: Services,
}

impl FeedbackLearner {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// The user reacted to a signal (agree/disagree button, optional
    /// free-text note).
    pub async fn on_signal_feedback(
        &self,
        user: &User,
        signal_id: i64,
        agreed: Option<bool>,
        text: Option<&str>,
    ) -> Result<()> {
        let signal = self.services.store.signal(signal_id)?;
        self.services
            .store
            .set_signal_feedback(signal_id, agreed, text)?;

        let label = classify_feedback(agreed, text);
        let symbol = signal.symbol.as_deref().unwrap_or("unknown");
        let content_preview: String = signal.content.chars().take(200).collect();
        let mut embedding_parts = vec![
            format!("시그널 피드백 ({label}): {symbol}"),
            format!("시그널: {content_preview}"),
        ];
        if let Some(text) = text {
            let note: String = text.chars().take(200).collect();
            embedding_parts.push(format!("유저 의견: {note}"));
        }

        let mut draft = EpisodeDraft::new(
            EpisodeKind::Feedback,
            format!("시그널 피드백 ({label}): {symbol}"),
            embedding_parts.join(" | "),
        );
        draft.reasoning = Some(match (text, agreed) {
            (Some(text), _) => text.to_string(),
            (None, Some(true)) => "동의".to_string(),
            (None, Some(false)) => "반대".to_string(),
            (None, None) => "미응답".to_string(),
        });
        draft.trade_data = Some(json!({
            "signal_id": signal.id,
            "kind": signal.kind.to_string(),
            "symbol": signal.symbol,
            "direction": signal.direction.map(|d| d.to_string()),
            "confidence": signal.confidence,
            "user_agreed": agreed,
        }));
        draft.feedback = Some(label.to_string());

        let episode_id = context::create_episode(&self.services, user, draft, false).await?;
        self.services
            .store
            .set_signal_episode(signal_id, episode_id)?;

        info!(user_id = user.id, signal_id, label, "signal feedback processed");
        Ok(())
    }

    /// A trade closed: link it to the signal it followed (same base
    /// symbol, opened inside the window) and record hit/miss/counter.
    pub async fn on_trade_close(&self, user: &User, trade: &Trade) -> Result<()> {
        let Some(pnl) = trade.pnl_percent else {
            return Ok(());
        };

        let Some(signal) = self.find_related_signal(user.id, trade)? else {
            debug!(trade_id = trade.id, symbol = %trade.symbol, "no related signal");
            return Ok(());
        };

        self.services
            .store
            .set_trade_followed(signal.id, true, Some(pnl))?;

        let direction_match = directions_match(signal.direction, trade.side);
        let result_label = if !direction_match {
            "반대매매"
        } else if pnl > 0.0 {
            "적중"
        } else {
            "미스"
        };

        let signal_direction = signal
            .direction
            .map(|d| d.to_string())
            .unwrap_or_else(|| "watch".to_string());
        let reasoning_preview: String = signal.reasoning.chars().take(200).collect();

        let mut draft = EpisodeDraft::new(
            EpisodeKind::Feedback,
            format!("매매 결과 피드백 ({result_label}): {} {pnl:+.1}%", trade.symbol),
            format!(
                "시그널 결과 ({result_label}): {} 시그널={signal_direction} 매매={} 결과={pnl:+.1}% 근거: {reasoning_preview}",
                trade.symbol, trade.side
            ),
        );
        draft.trade_data = Some(json!({
            "signal_id": signal.id,
            "trade_id": trade.id,
            "symbol": trade.symbol,
            "signal_direction": signal_direction,
            "trade_direction": trade.side.to_string(),
            "pnl_percent": pnl,
            "result": result_label,
            "confidence": signal.confidence,
        }));
        draft.trade_result = Some(json!({
            "pnl_percent": pnl,
            "direction_match": direction_match,
            "result": result_label,
        }));
        draft.reasoning = Some(format!(
            "시그널 {signal_direction} → 매매 {} → {pnl:+.1}%",
            trade.side
        ));
        draft.feedback = Some(result_label.to_string());

        context::create_episode(&self.services, user, draft, true).await?;

        info!(
            user_id = user.id,
            trade_id = trade.id,
            signal_id = signal.id,
            result = result_label,
            pnl_percent = pnl,
            "trade result feedback linked"
        );
        Ok(())
    }

    /// Patrol step: signals past the follow-up window with no trade get
    /// `trade_followed = false` and one unfollowed episode each.
    pub async fn check_unfollowed(&self, user: &User) -> Result<usize> {
        let cutoff = self.services.clock.now_utc() - Duration::hours(UNFOLLOWED_AFTER_HOURS);
        let unfollowed = self
            .services
            .store
            .unfollowed_signals_before(user.id, cutoff)?;
        let count = unfollowed.len();

        for signal in unfollowed {
            self.services
                .store
                .set_trade_followed(signal.id, false, None)?;

            let symbol = signal.symbol.as_deref().unwrap_or("");
            let direction = signal
                .direction
                .map(|d| d.to_string())
                .unwrap_or_default();
            let mut draft = EpisodeDraft::new(
                EpisodeKind::Feedback,
                format!("시그널 미매매: {symbol} {direction}"),
                format!(
                    "시그널 미매매: {symbol} {direction} conf={:.0}% — 유저가 따르지 않음",
                    signal.confidence * 100.0
                ),
            );
            draft.trade_data = Some(json!({
                "signal_id": signal.id,
                "symbol": signal.symbol,
                "direction": signal.direction.map(|d| d.to_string()),
                "confidence": signal.confidence,
                "result": "unfollowed",
            }));
            draft.reasoning =
                Some("유저가 시그널을 따르지 않음 — 다른 판단을 한 것으로 학습".to_string());
            draft.feedback = Some("unfollowed".to_string());
            context::create_episode(&self.services, user, draft, false).await?;
        }

        if count > 0 {
            info!(user_id = user.id, count, "unfollowed signals recorded");
        }
        Ok(count)
    }

    fn find_related_signal(&self, user_id: i64, trade: &Trade) -> Result<Option<Signal>> {
        let window_start = trade.opened_at - Duration::hours(LINK_BEFORE_OPEN_HOURS);
        let window_end = trade.opened_at + Duration::hours(LINK_AFTER_OPEN_HOURS);
        let candidates = self
            .services
            .store
            .signals_in_window(user_id, window_start, window_end)?;

        let trade_base = trade.base_symbol().to_uppercase();
        Ok(candidates.into_iter().find(|signal| {
            signal
                .base_symbol()
                .map(|base| base.to_uppercase() == trade_base)
                .unwrap_or(false)
        }))
    }
}

fn classify_feedback(agreed: Option<bool>, text: Option<&str>) -> &'static str {
    match (agreed, text) {
        (Some(true), Some(_)) => "동의+세부",
        (Some(true), None) => "동의",
        (Some(false), _) => "반대",
        (None, Some(_)) => "세부조정",
        (None, None) => "미응답",
    }
}

/// long/buy pairs with long/buy, short/sell with short/sell. Anything
/// else is a counter-trade.
fn directions_match(signal_direction: Option<Direction>, trade_side: TradeSide) -> bool {
    match signal_direction {
        Some(Direction::Long) => trade_side.is_long_like(),
        Some(Direction::Short) => trade_side.is_short_like(),
        _ => false,
    }
}
