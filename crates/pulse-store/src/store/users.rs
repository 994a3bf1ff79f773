use chrono::{DateTime, Utc};
use rusqlite::params;

use pulse_core::types::MONITORED_STAGE;

use super::{parse_enum, parse_ts_opt, ts, ts_opt, Store};
use crate::error::{Result, StoreError};
use crate::types::{ExchangeConnection, Principle, User};

const USER_COLS: &str = "id, external_id, display_name, language, tier, onboarding_stage, \
     last_active_at, daily_signal_count, daily_signal_reset_at, briefing_hour, \
     is_active, created_at";

/// Map a SELECT row (column order from USER_COLS) to a User.
fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        external_id: row.get(1)?,
        display_name: row.get(2)?,
        language: row.get(3)?,
        tier: row.get(4)?,
        onboarding_stage: row.get(5)?,
        last_active_at: parse_ts_opt(row.get(6)?),
        daily_signal_count: row.get(7)?,
        daily_signal_reset_at: parse_ts_opt(row.get(8)?),
        briefing_hour: row.get(9)?,
        is_active: row.get::<_, i64>(10)? != 0,
        created_at: super::parse_ts(&row.get::<_, String>(11)?),
    })
}

fn row_to_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExchangeConnection> {
    Ok(ExchangeConnection {
        id: row.get(0)?,
        user_id: row.get(1)?,
        exchange: row.get(2)?,
        api_key_enc: row.get(3)?,
        api_secret_enc: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        last_polled_at: parse_ts_opt(row.get(6)?),
    })
}

impl Store {
    pub fn create_user(
        &self,
        external_id: &str,
        display_name: Option<&str>,
        language: &str,
        now: DateTime<Utc>,
    ) -> Result<User> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (external_id, display_name, language, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![external_id, display_name, language, ts(now)],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.user(id)
    }

    pub fn user(&self, id: i64) -> Result<User> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
            [id],
            row_to_user,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound { entity: "user", id },
            other => other.into(),
        })
    }

    pub fn user_by_external(&self, external_id: &str) -> Result<Option<User>> {
        let conn = self.conn();
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE external_id = ?1"),
                [external_id],
                row_to_user,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(user)
    }

    /// Users visible to the monitoring loops: onboarding complete and active.
    pub fn monitored_users(&self) -> Result<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLS} FROM users
             WHERE onboarding_stage >= ?1 AND is_active = 1
             ORDER BY id"
        ))?;
        let users = stmt
            .query_map([MONITORED_STAGE], row_to_user)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(users)
    }

    pub fn set_onboarding_stage(&self, user_id: i64, stage: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET onboarding_stage = ?1 WHERE id = ?2",
            params![stage, user_id],
        )?;
        Ok(())
    }

    pub fn set_briefing_hour(&self, user_id: i64, hour: Option<i64>) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET briefing_hour = ?1 WHERE id = ?2",
            params![hour, user_id],
        )?;
        Ok(())
    }

    pub fn touch_last_active(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET last_active_at = ?1 WHERE id = ?2",
            params![ts(now), user_id],
        )?;
        Ok(())
    }

    pub fn set_daily_signal(
        &self,
        user_id: i64,
        count: i64,
        reset_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET daily_signal_count = ?1, daily_signal_reset_at = ?2
             WHERE id = ?3",
            params![count, ts_opt(reset_at), user_id],
        )?;
        Ok(())
    }

    /// Midnight reset of every user's daily signal budget.
    pub fn reset_all_signal_counts(&self, now: DateTime<Utc>) -> Result<usize> {
        let n = self.conn().execute(
            "UPDATE users SET daily_signal_count = 0, daily_signal_reset_at = ?1
             WHERE daily_signal_count > 0 OR daily_signal_reset_at IS NULL",
            params![ts(now)],
        )?;
        Ok(n)
    }

    /// Monitored users whose briefing hour equals `hour` (KST hour).
    pub fn users_with_briefing_hour(&self, hour: i64) -> Result<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLS} FROM users
             WHERE onboarding_stage >= ?1 AND is_active = 1 AND briefing_hour = ?2
             ORDER BY id"
        ))?;
        let users = stmt
            .query_map(params![MONITORED_STAGE, hour], row_to_user)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(users)
    }

    // --- exchange connections -----------------------------------------

    pub fn add_connection(
        &self,
        user_id: i64,
        exchange: &str,
        api_key_enc: &[u8],
        api_secret_enc: &[u8],
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO exchange_connections
               (user_id, exchange, api_key_enc, api_secret_enc, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, exchange) DO UPDATE SET
               api_key_enc = excluded.api_key_enc,
               api_secret_enc = excluded.api_secret_enc,
               is_active = 1",
            params![user_id, exchange, api_key_enc, api_secret_enc, ts(now)],
        )?;
        let id = conn.query_row(
            "SELECT id FROM exchange_connections WHERE user_id = ?1 AND exchange = ?2",
            params![user_id, exchange],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn active_connections(&self, user_id: i64) -> Result<Vec<ExchangeConnection>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, exchange, api_key_enc, api_secret_enc,
                    is_active, last_polled_at
             FROM exchange_connections
             WHERE user_id = ?1 AND is_active = 1
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map([user_id], row_to_connection)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn count_active_connections(&self, user_id: i64) -> Result<i64> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM exchange_connections
             WHERE user_id = ?1 AND is_active = 1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn set_connection_polled(&self, connection_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE exchange_connections SET last_polled_at = ?1 WHERE id = ?2",
            params![ts(at), connection_id],
        )?;
        Ok(())
    }

    // --- principles ----------------------------------------------------

    pub fn add_principle(
        &self,
        user_id: i64,
        content: &str,
        source: pulse_core::types::PrincipleSource,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO principles (user_id, content, source, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, content, source.to_string(), ts(now)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn active_principles(&self, user_id: i64) -> Result<Vec<Principle>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, content, source, is_active
             FROM principles
             WHERE user_id = ?1 AND is_active = 1
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map([user_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .map(|(id, user_id, content, source, is_active)| {
                Ok(Principle {
                    id,
                    user_id,
                    content,
                    source: parse_enum(source, "principles.source")?,
                    is_active: is_active != 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Soft delete: the row stays, only the flag flips.
    pub fn deactivate_principle(&self, principle_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE principles SET is_active = 0 WHERE id = ?1",
            [principle_id],
        )?;
        Ok(())
    }

    pub fn count_active_principles(&self, user_id: i64) -> Result<i64> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM principles WHERE user_id = ?1 AND is_active = 1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::types::PrincipleSource;

    #[test]
    fn create_and_fetch_user() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let user = store.create_user("tg-1", Some("Juno"), "ko", now).unwrap();
        assert_eq!(user.external_id, "tg-1");
        assert_eq!(user.onboarding_stage, 0);
        assert_eq!(user.daily_signal_count, 0);
        assert!(user.is_active);

        let fetched = store.user_by_external("tg-1").unwrap().unwrap();
        assert_eq!(fetched.id, user.id);
        assert!(store.user_by_external("tg-2").unwrap().is_none());
    }

    #[test]
    fn monitored_users_requires_stage_four() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let a = store.create_user("a", None, "ko", now).unwrap();
        let b = store.create_user("b", None, "ko", now).unwrap();
        store.set_onboarding_stage(b.id, 4).unwrap();

        let monitored = store.monitored_users().unwrap();
        assert_eq!(monitored.len(), 1);
        assert_eq!(monitored[0].id, b.id);
        assert_ne!(monitored[0].id, a.id);
    }

    #[test]
    fn signal_count_reset() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let user = store.create_user("a", None, "ko", now).unwrap();
        store.set_daily_signal(user.id, 5, Some(now)).unwrap();
        store.reset_all_signal_counts(now).unwrap();
        assert_eq!(store.user(user.id).unwrap().daily_signal_count, 0);
    }

    #[test]
    fn connections_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let user = store.create_user("a", None, "ko", now).unwrap();
        store
            .add_connection(user.id, "binance", b"enc-key", b"enc-secret", now)
            .unwrap();

        let conns = store.active_connections(user.id).unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].exchange, "binance");
        assert_eq!(conns[0].api_key_enc, b"enc-key");
        assert!(conns[0].last_polled_at.is_none());

        store.set_connection_polled(conns[0].id, now).unwrap();
        let conns = store.active_connections(user.id).unwrap();
        assert!(conns[0].last_polled_at.is_some());
        assert_eq!(store.count_active_connections(user.id).unwrap(), 1);
    }

    #[test]
    fn principles_soft_delete() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let user = store.create_user("a", None, "ko", now).unwrap();
        let pid = store
            .add_principle(user.id, "손절 -5% 칼같이", PrincipleSource::UserInput, now)
            .unwrap();
        assert_eq!(store.active_principles(user.id).unwrap().len(), 1);

        store.deactivate_principle(pid).unwrap();
        assert!(store.active_principles(user.id).unwrap().is_empty());
    }
}
