use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::params;

use pulse_core::types::{TriggerKind, TriggerSource};

use super::{col_to_json, parse_ts, parse_ts_opt, ts, Store};
use crate::error::{Result, StoreError};
use crate::types::{NewTrigger, UserTrigger};

const TRIGGER_COLS: &str = "id, user_id, kind, condition, composite_logic, base_streams_needed, \
     eval_prompt, data_needed, description, source, is_active, triggered_at, created_at";

fn row_to_trigger(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserTrigger> {
    Ok(UserTrigger {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or(TriggerKind::Alert),
        condition: col_to_json(row.get(3)?),
        composite_logic: row.get(4)?,
        base_streams_needed: col_to_json(row.get(5)?),
        eval_prompt: row.get(6)?,
        data_needed: col_to_json(row.get(7)?),
        description: row.get(8)?,
        source: row
            .get::<_, String>(9)?
            .parse()
            .unwrap_or(TriggerSource::UserRequest),
        is_active: row.get::<_, i64>(10)? != 0,
        triggered_at: parse_ts_opt(row.get(11)?),
        created_at: parse_ts(&row.get::<_, String>(12)?),
    })
}

impl Store {
    pub fn create_trigger(
        &self,
        user_id: i64,
        new: &NewTrigger,
        now: DateTime<Utc>,
    ) -> Result<UserTrigger> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO user_triggers
               (user_id, kind, condition, composite_logic, base_streams_needed,
                eval_prompt, data_needed, description, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user_id,
                new.kind.unwrap_or(TriggerKind::Alert).to_string(),
                new.condition.as_ref().map(|v| v.to_string()),
                new.composite_logic,
                new.base_streams_needed.as_ref().map(|v| v.to_string()),
                new.eval_prompt,
                new.data_needed.as_ref().map(|v| v.to_string()),
                new.description,
                new.source.unwrap_or(TriggerSource::UserRequest).to_string(),
                ts(now)
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {TRIGGER_COLS} FROM user_triggers WHERE id = ?1"),
            [id],
            row_to_trigger,
        )
        .map_err(Into::into)
    }

    pub fn trigger(&self, id: i64) -> Result<UserTrigger> {
        self.conn()
            .query_row(
                &format!("SELECT {TRIGGER_COLS} FROM user_triggers WHERE id = ?1"),
                [id],
                row_to_trigger,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                    entity: "user_trigger",
                    id,
                },
                other => other.into(),
            })
    }

    /// Active triggers of the given kinds, id ascending so two triggers
    /// colliding on one tick fire in a deterministic order.
    pub fn active_triggers(
        &self,
        user_id: i64,
        kinds: &[TriggerKind],
    ) -> Result<Vec<UserTrigger>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRIGGER_COLS} FROM user_triggers
             WHERE user_id = ?1 AND is_active = 1
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([user_id], row_to_trigger)?
            .filter_map(|r| r.ok())
            .filter(|t| kinds.contains(&t.kind))
            .collect();
        Ok(rows)
    }

    /// Retire a trigger: no further evaluation, firing time recorded.
    pub fn retire_trigger(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE user_triggers SET is_active = 0, triggered_at = ?1 WHERE id = ?2",
            params![ts(at), id],
        )?;
        Ok(())
    }

    /// Record an evaluation time without retiring (deferred NO verdicts).
    pub fn mark_triggered(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE user_triggers SET triggered_at = ?1 WHERE id = ?2",
            params![ts(at), id],
        )?;
        Ok(())
    }

    /// Descriptions of active patrol-created triggers, for dedup before
    /// synthesising a new one.
    pub fn active_patrol_descriptions(&self, user_id: i64) -> Result<HashSet<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT description FROM user_triggers
             WHERE user_id = ?1 AND is_active = 1 AND source = 'patrol'",
        )?;
        let set = stmt
            .query_map([user_id], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(set)
    }

    /// Retire system-created triggers that have stayed active past the
    /// cutoff without ever firing. User-requested triggers are untouched.
    pub fn retire_stale_auto_triggers(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let n = self.conn().execute(
            "UPDATE user_triggers SET is_active = 0
             WHERE is_active = 1
               AND source IN ('llm_auto', 'patrol')
               AND created_at < ?1",
            params![ts(cutoff)],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store_with_user() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let user = store.create_user("u", None, "ko", Utc::now()).unwrap();
        (store, user.id)
    }

    fn alert(desc: &str) -> NewTrigger {
        NewTrigger {
            kind: Some(TriggerKind::Alert),
            condition: Some(serde_json::json!({
                "type": "price_above", "symbol": "BTC", "value": 100000.0
            })),
            description: desc.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn active_triggers_ordered_by_id() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        let t1 = store.create_trigger(uid, &alert("first"), now).unwrap();
        let t2 = store.create_trigger(uid, &alert("second"), now).unwrap();

        let active = store
            .active_triggers(uid, &[TriggerKind::Alert, TriggerKind::Signal])
            .unwrap();
        assert_eq!(
            active.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![t1.id, t2.id]
        );
    }

    #[test]
    fn retire_sets_flags() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        let t = store.create_trigger(uid, &alert("a"), now).unwrap();
        assert!(t.is_active);
        assert!(t.triggered_at.is_none());

        store.retire_trigger(t.id, now).unwrap();
        let t = store.trigger(t.id).unwrap();
        assert!(!t.is_active);
        assert!(t.triggered_at.is_some());
    }

    #[test]
    fn stale_cleanup_spares_user_requests() {
        let (store, uid) = store_with_user();
        let old = Utc::now() - Duration::hours(80);

        let mut auto = alert("auto");
        auto.kind = Some(TriggerKind::LlmEvaluated);
        auto.source = Some(TriggerSource::Patrol);
        auto.eval_prompt = Some("분위기 평가".to_string());
        let auto = store.create_trigger(uid, &auto, old).unwrap();

        let mut manual = alert("manual");
        manual.source = Some(TriggerSource::UserRequest);
        let manual = store.create_trigger(uid, &manual, old).unwrap();

        let cutoff = Utc::now() - Duration::hours(72);
        let retired = store.retire_stale_auto_triggers(cutoff).unwrap();
        assert_eq!(retired, 1);
        assert!(!store.trigger(auto.id).unwrap().is_active);
        assert!(store.trigger(manual.id).unwrap().is_active);
    }

    #[test]
    fn patrol_descriptions_dedup_set() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        let mut t = alert("BTC 24h +12.0%");
        t.kind = Some(TriggerKind::LlmEvaluated);
        t.source = Some(TriggerSource::Patrol);
        store.create_trigger(uid, &t, now).unwrap();

        let descs = store.active_patrol_descriptions(uid).unwrap();
        assert!(descs.contains("BTC 24h +12.0%"));
        assert!(!descs.contains("ETH 24h +12.0%"));
    }
}
