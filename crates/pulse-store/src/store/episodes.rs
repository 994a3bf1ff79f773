use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::Value;

use pulse_core::types::{EpisodeKind, PatrolKind};

use super::{col_to_json, parse_ts, ts, Store};
use crate::error::{Result, StoreError};
use crate::types::{Episode, EpisodeDraft};

const EPISODE_COLS: &str = "id, user_id, kind, market_context, user_action, trade_data, reasoning, \
     trade_result, feedback, expression_calibration, style_tags, \
     embedding_text, vector_id, created_at";

fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or(EpisodeKind::Chat),
        market_context: col_to_json(row.get(3)?),
        user_action: row.get(4)?,
        trade_data: col_to_json(row.get(5)?),
        reasoning: row.get(6)?,
        trade_result: col_to_json(row.get(7)?),
        feedback: row.get(8)?,
        expression_calibration: col_to_json(row.get(9)?),
        style_tags: col_to_json(row.get(10)?),
        embedding_text: row.get(11)?,
        vector_id: row.get(12)?,
        created_at: parse_ts(&row.get::<_, String>(13)?),
    })
}

impl Store {
    /// Insert the episode row. The vector upsert happens outside the
    /// transaction; `set_episode_vector_id` records its result afterwards.
    pub fn insert_episode(
        &self,
        user_id: i64,
        draft: &EpisodeDraft,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO episodes
               (user_id, kind, market_context, user_action, trade_data, reasoning,
                trade_result, feedback, expression_calibration, style_tags,
                embedding_text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                user_id,
                draft.kind.to_string(),
                draft.market_context.as_ref().map(|v| v.to_string()),
                draft.user_action,
                draft.trade_data.as_ref().map(|v| v.to_string()),
                draft.reasoning,
                draft.trade_result.as_ref().map(|v| v.to_string()),
                draft.feedback,
                draft.expression_calibration.as_ref().map(|v| v.to_string()),
                draft.style_tags.as_ref().map(|v| v.to_string()),
                draft.embedding_text,
                ts(now)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_episode_vector_id(&self, episode_id: i64, vector_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE episodes SET vector_id = ?1 WHERE id = ?2",
            params![vector_id, episode_id],
        )?;
        Ok(())
    }

    pub fn episode(&self, id: i64) -> Result<Episode> {
        self.conn()
            .query_row(
                &format!("SELECT {EPISODE_COLS} FROM episodes WHERE id = ?1"),
                [id],
                row_to_episode,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                    entity: "episode",
                    id,
                },
                other => other.into(),
            })
    }

    pub fn recent_episodes(&self, user_id: i64, limit: usize) -> Result<Vec<Episode>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EPISODE_COLS} FROM episodes
             WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], row_to_episode)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn episodes_by_ids(&self, ids: &[i64]) -> Result<Vec<Episode>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {EPISODE_COLS} FROM episodes WHERE id IN ({placeholders})");
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), row_to_episode)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Episodes carrying an expression calibration entry, newest first.
    pub fn calibration_episodes(&self, user_id: i64) -> Result<Vec<Episode>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EPISODE_COLS} FROM episodes
             WHERE user_id = ?1 AND expression_calibration IS NOT NULL
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt
            .query_map([user_id], row_to_episode)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn count_episodes(&self, user_id: i64) -> Result<i64> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM episodes WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    // --- patrol logs ---------------------------------------------------

    pub fn insert_patrol_log(
        &self,
        user_id: i64,
        kind: PatrolKind,
        findings: &Value,
        actions_taken: &Value,
        temperature_changes: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO patrol_logs
               (user_id, kind, findings, actions_taken, temperature_changes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                kind.to_string(),
                findings.to_string(),
                actions_taken.to_string(),
                temperature_changes.map(|v| v.to_string()),
                ts(now)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn count_patrol_logs(&self, user_id: i64) -> Result<i64> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM patrol_logs WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_user() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let user = store.create_user("u", None, "ko", Utc::now()).unwrap();
        (store, user.id)
    }

    #[test]
    fn insert_then_record_vector_id() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        let draft = EpisodeDraft::new(EpisodeKind::Signal, "시그널: BTC long", "BTC 근거 요약");
        let id = store.insert_episode(uid, &draft, now).unwrap();

        // The row is durable before any vector work happens.
        let ep = store.episode(id).unwrap();
        assert!(ep.vector_id.is_none());

        store.set_episode_vector_id(id, "ep_1").unwrap();
        assert_eq!(store.episode(id).unwrap().vector_id.as_deref(), Some("ep_1"));
    }

    #[test]
    fn calibration_episodes_filter() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        let mut with_cal = EpisodeDraft::new(EpisodeKind::Chat, "캘리브레이션", "좀 빠진다 = -3.2%");
        with_cal.expression_calibration =
            Some(serde_json::json!({"expression": "좀 빠진다", "actual_value": -3.2}));
        store.insert_episode(uid, &with_cal, now).unwrap();
        store
            .insert_episode(uid, &EpisodeDraft::new(EpisodeKind::Chat, "x", "y"), now)
            .unwrap();

        let cals = store.calibration_episodes(uid).unwrap();
        assert_eq!(cals.len(), 1);
        assert_eq!(
            cals[0].expression_calibration.as_ref().unwrap()["expression"],
            "좀 빠진다"
        );
    }

    #[test]
    fn patrol_log_round_trip() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        store
            .insert_patrol_log(
                uid,
                PatrolKind::Scheduled,
                &serde_json::json!([{"type": "price_surge", "symbol": "BTC"}]),
                &serde_json::json!([]),
                Some(&serde_json::json!({"hot_to_warm": 2})),
                now,
            )
            .unwrap();
        assert_eq!(store.count_patrol_logs(uid).unwrap(), 1);
    }
}
