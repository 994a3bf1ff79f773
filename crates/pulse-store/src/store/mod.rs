mod episodes;
mod messages;
mod signals;
mod streams;
mod trades;
mod triggers;
mod users;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::info;

use crate::db::init_db;
use crate::error::{Result, StoreError};

/// Transactional store for all per-user entities.
///
/// Thread-safe: wraps the SQLite connection in a Mutex. Sessions are
/// per-event and short; callers hold the lock only for the duration of
/// one method call.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating parent directories as needed) and initialise the schema.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_db(&conn)?;
        info!(path, "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Delete a user and every row it owns, child tables first so
    /// referential integrity holds without foreign-key cycles.
    pub fn delete_user(&self, user_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for table in [
            "chat_messages",
            "patrol_logs",
            "episodes",
            "signals",
            "trades",
            "user_triggers",
            "base_streams",
            "principles",
            "exchange_connections",
        ] {
            tx.execute(&format!("DELETE FROM {table} WHERE user_id = ?1"), [user_id])?;
        }
        let n = tx.execute("DELETE FROM users WHERE id = ?1", [user_id])?;
        tx.commit()?;
        if n == 0 {
            return Err(StoreError::NotFound {
                entity: "user",
                id: user_id,
            });
        }
        info!(user_id, "user deleted with cascade");
        Ok(())
    }
}

// --- column helpers shared by the entity modules -----------------------

/// Fixed-width UTC timestamp (nanosecond fraction) so TEXT comparison
/// equals chronological order and round-trips exactly.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string()
}

pub(crate) fn ts_opt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_ts(&v))
}

pub(crate) fn json_opt_to_col(v: Option<&serde_json::Value>) -> Option<String> {
    v.map(|x| x.to_string())
}

pub(crate) fn col_to_json(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|raw| serde_json::from_str(&raw).ok())
}

pub(crate) fn parse_enum<T: std::str::FromStr>(
    value: String,
    column: &'static str,
) -> Result<T> {
    value.parse().map_err(|_| StoreError::BadColumn {
        column,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn init_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        // Re-running the schema against the live connection must not fail.
        init_db(&store.conn()).unwrap();
    }

    #[test]
    fn ts_is_lexicographically_ordered() {
        let a = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        let c = a + chrono::Duration::hours(1);
        assert!(ts(a) < ts(b));
        assert!(ts(b) < ts(c));
        assert_eq!(parse_ts(&ts(a)), a);
    }

    #[test]
    fn cascade_delete_removes_children() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let user = store.create_user("u-100", None, "ko", now).unwrap();
        store
            .upsert_stream(user.id, "price", Some("BTC"), None, now)
            .unwrap();
        store
            .insert_message(
                user.id,
                &crate::types::NewMessage::assistant("hello", "general"),
                now,
            )
            .unwrap();

        store.delete_user(user.id).unwrap();

        assert!(store.user_by_external("u-100").unwrap().is_none());
        let conn = store.conn();
        let streams: i64 = conn
            .query_row("SELECT COUNT(*) FROM base_streams", [], |r| r.get(0))
            .unwrap();
        let messages: i64 = conn
            .query_row("SELECT COUNT(*) FROM chat_messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(streams, 0);
        assert_eq!(messages, 0);
    }

    #[test]
    fn delete_missing_user_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.delete_user(999),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn open_creates_file_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.db");
        let path = path.to_str().unwrap();
        let now = Utc::now();

        {
            let store = Store::open(path).unwrap();
            store.create_user("durable", None, "ko", now).unwrap();
        }
        let store = Store::open(path).unwrap();
        assert!(store.user_by_external("durable").unwrap().is_some());
    }
}
