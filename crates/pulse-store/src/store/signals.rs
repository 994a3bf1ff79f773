use chrono::{DateTime, Utc};
use rusqlite::params;

use pulse_core::types::SignalKind;

use super::{parse_ts, ts, Store};
use crate::error::{Result, StoreError};
use crate::types::{NewSignal, Signal};

const SIGNAL_COLS: &str = "id, user_id, kind, content, reasoning, counter_argument, confidence, \
     confidence_style, confidence_history, confidence_market, symbol, direction, \
     stop_loss, user_feedback, user_agreed, trade_followed, trade_result_pnl, \
     episode_id, created_at";

fn row_to_signal(row: &rusqlite::Row<'_>) -> rusqlite::Result<Signal> {
    Ok(Signal {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or(SignalKind::TradeSignal),
        content: row.get(3)?,
        reasoning: row.get(4)?,
        counter_argument: row.get(5)?,
        confidence: row.get(6)?,
        confidence_style: row.get(7)?,
        confidence_history: row.get(8)?,
        confidence_market: row.get(9)?,
        symbol: row.get(10)?,
        direction: row
            .get::<_, Option<String>>(11)?
            .and_then(|s| s.parse().ok()),
        stop_loss: row.get(12)?,
        user_feedback: row.get(13)?,
        user_agreed: row.get::<_, Option<i64>>(14)?.map(|v| v != 0),
        trade_followed: row.get::<_, Option<i64>>(15)?.map(|v| v != 0),
        trade_result_pnl: row.get(16)?,
        episode_id: row.get(17)?,
        created_at: parse_ts(&row.get::<_, String>(18)?),
    })
}

impl Store {
    pub fn insert_signal(
        &self,
        user_id: i64,
        new: &NewSignal,
        now: DateTime<Utc>,
    ) -> Result<Signal> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO signals
               (user_id, kind, content, reasoning, counter_argument, confidence,
                confidence_style, confidence_history, confidence_market,
                symbol, direction, stop_loss, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                user_id,
                new.kind.unwrap_or(SignalKind::TradeSignal).to_string(),
                new.content,
                new.reasoning,
                new.counter_argument,
                new.confidence,
                new.confidence_style,
                new.confidence_history,
                new.confidence_market,
                new.symbol,
                new.direction.map(|d| d.to_string()),
                new.stop_loss,
                ts(now)
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {SIGNAL_COLS} FROM signals WHERE id = ?1"),
            [id],
            row_to_signal,
        )
        .map_err(Into::into)
    }

    pub fn signal(&self, id: i64) -> Result<Signal> {
        self.conn()
            .query_row(
                &format!("SELECT {SIGNAL_COLS} FROM signals WHERE id = ?1"),
                [id],
                row_to_signal,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                    entity: "signal",
                    id,
                },
                other => other.into(),
            })
    }

    pub fn recent_signals(&self, user_id: i64, limit: usize) -> Result<Vec<Signal>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SIGNAL_COLS} FROM signals
             WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], row_to_signal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Trade signals older than `cutoff` whose follow-up is still unknown.
    pub fn unfollowed_signals_before(
        &self,
        user_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Signal>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SIGNAL_COLS} FROM signals
             WHERE user_id = ?1 AND kind = 'trade_signal'
               AND trade_followed IS NULL AND created_at < ?2
             ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![user_id, ts(cutoff)], row_to_signal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Trade signals created inside [start, end], newest first — the
    /// candidate set for trade↔signal linkage.
    pub fn signals_in_window(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Signal>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SIGNAL_COLS} FROM signals
             WHERE user_id = ?1 AND kind = 'trade_signal'
               AND created_at >= ?2 AND created_at <= ?3
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt
            .query_map(params![user_id, ts(start), ts(end)], row_to_signal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn set_trade_followed(
        &self,
        signal_id: i64,
        followed: bool,
        result_pnl: Option<f64>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE signals SET trade_followed = ?1, trade_result_pnl = ?2 WHERE id = ?3",
            params![followed as i64, result_pnl, signal_id],
        )?;
        Ok(())
    }

    pub fn set_signal_feedback(
        &self,
        signal_id: i64,
        agreed: Option<bool>,
        feedback: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        if let Some(agreed) = agreed {
            conn.execute(
                "UPDATE signals SET user_agreed = ?1 WHERE id = ?2",
                params![agreed as i64, signal_id],
            )?;
        }
        if let Some(text) = feedback {
            conn.execute(
                "UPDATE signals SET user_feedback = ?1 WHERE id = ?2",
                params![text, signal_id],
            )?;
        }
        Ok(())
    }

    pub fn set_signal_episode(&self, signal_id: i64, episode_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE signals SET episode_id = ?1 WHERE id = ?2",
            params![episode_id, signal_id],
        )?;
        Ok(())
    }

    /// (signals with a recorded agree/disagree, agreed, followed) — the
    /// judgement inputs for the sync metric.
    pub fn judgement_counts(&self, user_id: i64) -> Result<(i64, i64, i64)> {
        let conn = self.conn();
        let with_agreed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM signals WHERE user_id = ?1 AND user_agreed IS NOT NULL",
            [user_id],
            |row| row.get(0),
        )?;
        let agreed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM signals WHERE user_id = ?1 AND user_agreed = 1",
            [user_id],
            |row| row.get(0),
        )?;
        let followed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM signals WHERE user_id = ?1 AND trade_followed = 1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok((with_agreed, agreed, followed))
    }
}
