//! Sync rate: how closely the assistant's model of the user matches the
//! user. Learning completeness (40%) plus judgement agreement (60%).
//! Derived read model, computed on demand.

use chrono::Duration;

use pulse_store::types::User;

use crate::error::Result;
use crate::services::Services;

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub sync_rate: f64,
    pub learning: f64,
    /// Undefined until at least 5 signals carry an agree/disagree answer.
    pub judgement: Option<f64>,
    pub connections: i64,
    pub principles: i64,
    pub episodes: i64,
    pub messages_7d: i64,
    pub signals_with_feedback: i64,
}

pub fn calculate(services: &Services, user: &User) -> Result<SyncReport> {
    let store = &services.store;
    let now = services.clock.now_utc();
    let week_ago = now - Duration::days(7);

    let connections = store.count_active_connections(user.id)?;
    let principles = store.count_active_principles(user.id)?;
    let episodes = store.count_episodes(user.id)?;
    let messages_7d = store.count_user_messages_since(user.id, week_ago)?;

    let learning = round1(
        clamp01(connections as f64 / 3.0) * 25.0
            + clamp01(principles as f64 / 5.0) * 25.0
            + clamp01(episodes as f64 / 50.0) * 30.0
            + clamp01(messages_7d as f64 / 20.0) * 20.0,
    );

    let (with_agreed, agreed, followed) = store.judgement_counts(user.id)?;
    let judgement = if with_agreed >= 5 {
        let agree_pct = agreed as f64 / with_agreed as f64 * 100.0;
        let follow_pct = followed as f64 / with_agreed as f64 * 100.0;
        let (reason_total, reason_correct) = store.reasoning_confirmation_counts(user.id)?;
        let reason_pct = if reason_total > 0 {
            reason_correct as f64 / reason_total as f64 * 100.0
        } else {
            0.0
        };
        Some(round1(agree_pct * 0.4 + follow_pct * 0.3 + reason_pct * 0.3))
    } else {
        None
    };

    let sync_rate = round1(learning * 0.4 + judgement.unwrap_or(0.0) * 0.6);

    Ok(SyncReport {
        sync_rate,
        learning,
        judgement,
        connections,
        principles,
        episodes,
        messages_7d,
        signals_with_feedback: with_agreed,
    })
}

fn clamp01(v: f64) -> f64 {
    v.min(1.0)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::harness;
    use pulse_core::types::PrincipleSource;
    use pulse_store::types::{EpisodeDraft, NewSignal};

    #[test]
    fn learning_only_when_feedback_sparse() {
        let h = harness();
        let now = h.services.clock.now_utc();
        let user = h.services.store.create_user("u", None, "ko", now).unwrap();
        h.services
            .store
            .add_connection(user.id, "binance", b"k", b"s", now)
            .unwrap();
        for i in 0..5 {
            h.services
                .store
                .add_principle(user.id, &format!("원칙 {i}"), PrincipleSource::UserInput, now)
                .unwrap();
        }
        let user = h.services.store.user(user.id).unwrap();

        let report = calculate(&h.services, &user).unwrap();
        // connections 1/3 → 8.3, principles 5/5 → 25.0
        assert_eq!(report.learning, 33.3);
        assert!(report.judgement.is_none());
        assert_eq!(report.sync_rate, round1(33.3 * 0.4));
    }

    #[test]
    fn judgement_kicks_in_at_five_answers() {
        let h = harness();
        let now = h.services.clock.now_utc();
        let user = h.services.store.create_user("u", None, "ko", now).unwrap();
        for i in 0..5 {
            let s = h
                .services
                .store
                .insert_signal(
                    user.id,
                    &NewSignal {
                        content: "sig".to_string(),
                        reasoning: "r".to_string(),
                        confidence: 0.5,
                        ..Default::default()
                    },
                    now,
                )
                .unwrap();
            h.services
                .store
                .set_signal_feedback(s.id, Some(i < 4), None)
                .unwrap();
            if i < 2 {
                h.services
                    .store
                    .set_trade_followed(s.id, true, Some(1.0))
                    .unwrap();
            }
        }
        h.services
            .store
            .insert_episode(
                user.id,
                &EpisodeDraft::new(pulse_core::types::EpisodeKind::Chat, "a", "b"),
                now,
            )
            .unwrap();

        let user = h.services.store.user(user.id).unwrap();
        let report = calculate(&h.services, &user).unwrap();

        // agree 4/5 = 80%, follow 2/5 = 40%, reasoning 0 → judge = 44.0
        assert_eq!(report.judgement, Some(44.0));
        assert_eq!(report.signals_with_feedback, 5);
        assert_eq!(
            report.sync_rate,
            round1(report.learning * 0.4 + 44.0 * 0.6)
        );
    }
}
