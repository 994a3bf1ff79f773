use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::Value;

use pulse_core::types::Temperature;

use super::{col_to_json, json_opt_to_col, parse_enum, parse_ts, ts, Store};
use crate::error::Result;
use crate::types::BaseStream;

const STREAM_COLS: &str =
    "id, user_id, stream_type, symbol, config, temperature, last_mentioned_at, last_value";

fn row_to_stream(row: &rusqlite::Row<'_>) -> rusqlite::Result<BaseStream> {
    let config: Option<String> = row.get(4)?;
    Ok(BaseStream {
        id: row.get(0)?,
        user_id: row.get(1)?,
        stream_type: row.get(2)?,
        symbol: row.get(3)?,
        config: config
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| serde_json::json!({})),
        temperature: row
            .get::<_, String>(5)?
            .parse()
            .unwrap_or(Temperature::Cold),
        last_mentioned_at: parse_ts(&row.get::<_, String>(6)?),
        last_value: col_to_json(row.get(7)?),
    })
}

impl Store {
    /// Add a stream, or restore an existing one to hot (re-mention).
    pub fn upsert_stream(
        &self,
        user_id: i64,
        stream_type: &str,
        symbol: Option<&str>,
        config: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<BaseStream> {
        let conn = self.conn();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM base_streams
                 WHERE user_id = ?1 AND stream_type = ?2 AND symbol IS ?3",
                params![user_id, stream_type, symbol],
                |row| row.get(0),
            )
            .ok();

        let id = match existing {
            Some(id) => {
                if let Some(cfg) = config {
                    conn.execute(
                        "UPDATE base_streams
                         SET temperature = 'hot', last_mentioned_at = ?1, config = ?2
                         WHERE id = ?3",
                        params![ts(now), cfg.to_string(), id],
                    )?;
                } else {
                    conn.execute(
                        "UPDATE base_streams
                         SET temperature = 'hot', last_mentioned_at = ?1
                         WHERE id = ?2",
                        params![ts(now), id],
                    )?;
                }
                id
            }
            None => {
                conn.execute(
                    "INSERT INTO base_streams
                       (user_id, stream_type, symbol, config, temperature,
                        last_mentioned_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, 'hot', ?5, ?5)",
                    params![
                        user_id,
                        stream_type,
                        symbol,
                        json_opt_to_col(config).unwrap_or_else(|| "{}".to_string()),
                        ts(now)
                    ],
                )?;
                conn.last_insert_rowid()
            }
        };

        conn.query_row(
            &format!("SELECT {STREAM_COLS} FROM base_streams WHERE id = ?1"),
            [id],
            row_to_stream,
        )
        .map_err(Into::into)
    }

    /// Restore every stream of a mentioned symbol to hot. Returns how many
    /// rows changed temperature.
    pub fn touch_streams(&self, user_id: i64, symbol: &str, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let promoted = conn.execute(
            "UPDATE base_streams SET temperature = 'hot', last_mentioned_at = ?1
             WHERE user_id = ?2 AND symbol = ?3",
            params![ts(now), user_id, symbol],
        )?;
        Ok(promoted)
    }

    /// All streams of one temperature, across every user. The pollers read
    /// globally because market data is not per-user.
    pub fn streams_by_temperature(&self, temperature: Temperature) -> Result<Vec<BaseStream>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STREAM_COLS} FROM base_streams WHERE temperature = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([temperature.to_string()], row_to_stream)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// One user's streams in any of the given temperature classes.
    pub fn user_streams(
        &self,
        user_id: i64,
        temperatures: &[Temperature],
    ) -> Result<Vec<BaseStream>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STREAM_COLS} FROM base_streams WHERE user_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([user_id], row_to_stream)?
            .filter_map(|r| r.ok())
            .filter(|s| temperatures.contains(&s.temperature))
            .collect();
        Ok(rows)
    }

    pub fn set_stream_value(&self, stream_id: i64, value: &Value) -> Result<()> {
        self.conn().execute(
            "UPDATE base_streams SET last_value = ?1 WHERE id = ?2",
            params![value.to_string(), stream_id],
        )?;
        Ok(())
    }

    pub fn stream(&self, stream_id: i64) -> Result<BaseStream> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {STREAM_COLS} FROM base_streams WHERE id = ?1"),
            [stream_id],
            row_to_stream,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => crate::error::StoreError::NotFound {
                entity: "base_stream",
                id: stream_id,
            },
            other => other.into(),
        })
    }

    /// Demote streams not mentioned since `cutoff` from `from` to `to`.
    /// Returns the number of demoted rows.
    pub fn transition_temperatures(
        &self,
        user_id: i64,
        from: Temperature,
        to: Temperature,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let n = self.conn().execute(
            "UPDATE base_streams SET temperature = ?1
             WHERE user_id = ?2 AND temperature = ?3 AND last_mentioned_at < ?4",
            params![to.to_string(), user_id, from.to_string(), ts(cutoff)],
        )?;
        Ok(n)
    }

    pub fn stream_temperature(&self, stream_id: i64) -> Result<Temperature> {
        let value: String = self.conn().query_row(
            "SELECT temperature FROM base_streams WHERE id = ?1",
            [stream_id],
            |row| row.get(0),
        )?;
        parse_enum(value, "base_streams.temperature")
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

    #[test]
    fn upsert_is_idempotent_and_restores_hot() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        let s1 = store
            .upsert_stream(uid, "price", Some("BTC"), None, now)
            .unwrap();
        let s2 = store
            .upsert_stream(uid, "price", Some("BTC"), None, now)
            .unwrap();
        assert_eq!(s1.id, s2.id);

        // Demote, then re-upsert must restore hot.
        store
            .transition_temperatures(uid, Temperature::Hot, Temperature::Warm, now + Duration::days(1))
            .unwrap();
        assert_eq!(store.stream_temperature(s1.id).unwrap(), Temperature::Warm);
        let s3 = store
            .upsert_stream(uid, "price", Some("BTC"), None, now)
            .unwrap();
        assert_eq!(s3.temperature, Temperature::Hot);
    }

    #[test]
    fn null_symbol_is_unique_too() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        let a = store.upsert_stream(uid, "news", None, None, now).unwrap();
        let b = store.upsert_stream(uid, "news", None, None, now).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.data_key(), "news/all");
    }

    #[test]
    fn touch_promotes_all_streams_of_symbol() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        let price = store
            .upsert_stream(uid, "price", Some("SOL"), None, now)
            .unwrap();
        let funding = store
            .upsert_stream(uid, "funding", Some("SOL"), None, now)
            .unwrap();
        store
            .transition_temperatures(uid, Temperature::Hot, Temperature::Cold, now + Duration::days(40))
            .unwrap();

        let later = now + Duration::days(40);
        store.touch_streams(uid, "SOL", later).unwrap();

        for id in [price.id, funding.id] {
            let s = store.stream(id).unwrap();
            assert_eq!(s.temperature, Temperature::Hot);
            assert_eq!(s.last_mentioned_at, later);
        }
    }

    #[test]
    fn transition_respects_cutoffs() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        store
            .upsert_stream(uid, "price", Some("BTC"), None, now - Duration::days(10))
            .unwrap();
        store
            .upsert_stream(uid, "price", Some("ETH"), None, now - Duration::days(2))
            .unwrap();

        let hot_cutoff = now - Duration::days(7);
        let demoted = store
            .transition_temperatures(uid, Temperature::Hot, Temperature::Warm, hot_cutoff)
            .unwrap();
        assert_eq!(demoted, 1);

        let warm = store.user_streams(uid, &[Temperature::Warm]).unwrap();
        assert_eq!(warm.len(), 1);
        assert_eq!(warm[0].symbol.as_deref(), Some("BTC"));
    }

    #[test]
    fn last_value_round_trips() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        let s = store
            .upsert_stream(uid, "price", Some("BTC"), None, now)
            .unwrap();
        assert!(s.last_value.is_none());

        let value = serde_json::json!({"last": 100000.0, "change_24h_pct": -1.2});
        store.set_stream_value(s.id, &value).unwrap();
        let s = store.stream(s.id).unwrap();
        assert_eq!(s.last_value.unwrap()["last"], 100000.0);
    }
}
