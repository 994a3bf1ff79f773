use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use pulse_core::types::{TradeSide, TradeStatus};

use super::{parse_ts, parse_ts_opt, ts, Store};
use crate::error::{Result, StoreError};
use crate::types::{NewTrade, Trade};

const TRADE_COLS: &str = "id, user_id, exchange, symbol, side, entry_price, exit_price, size, \
     leverage, pnl_percent, pnl_amount, status, inferred_reasoning, \
     user_confirmed_reasoning, user_actual_reasoning, episode_id, \
     opened_at, closed_at, created_at";

fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
    Ok(Trade {
        id: row.get(0)?,
        user_id: row.get(1)?,
        exchange: row.get(2)?,
        symbol: row.get(3)?,
        side: row.get::<_, String>(4)?.parse().unwrap_or(TradeSide::Buy),
        entry_price: row.get(5)?,
        exit_price: row.get(6)?,
        size: row.get(7)?,
        leverage: row.get(8)?,
        pnl_percent: row.get(9)?,
        pnl_amount: row.get(10)?,
        status: row
            .get::<_, String>(11)?
            .parse()
            .unwrap_or(TradeStatus::Open),
        inferred_reasoning: row.get(12)?,
        user_confirmed_reasoning: row.get::<_, Option<i64>>(13)?.map(|v| v != 0),
        user_actual_reasoning: row.get(14)?,
        episode_id: row.get(15)?,
        opened_at: parse_ts(&row.get::<_, String>(16)?),
        closed_at: parse_ts_opt(row.get(17)?),
        created_at: parse_ts(&row.get::<_, String>(18)?),
    })
}

impl Store {
    pub fn insert_trade(&self, user_id: i64, new: &NewTrade, now: DateTime<Utc>) -> Result<Trade> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO trades
               (user_id, exchange, symbol, side, entry_price, size, leverage,
                status, opened_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open', ?8, ?9)",
            params![
                user_id,
                new.exchange,
                new.symbol,
                new.side.to_string(),
                new.entry_price,
                new.size,
                new.leverage,
                ts(new.opened_at),
                ts(now)
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {TRADE_COLS} FROM trades WHERE id = ?1"),
            [id],
            row_to_trade,
        )
        .map_err(Into::into)
    }

    pub fn trade(&self, id: i64) -> Result<Trade> {
        self.conn()
            .query_row(
                &format!("SELECT {TRADE_COLS} FROM trades WHERE id = ?1"),
                [id],
                row_to_trade,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                    entity: "trade",
                    id,
                },
                other => other.into(),
            })
    }

    /// The idempotence window for detection: same user/exchange/symbol with
    /// an open time within ± `tolerance_secs`.
    pub fn duplicate_trade_exists(
        &self,
        user_id: i64,
        exchange: &str,
        symbol: &str,
        opened_at: DateTime<Utc>,
        tolerance_secs: i64,
    ) -> Result<bool> {
        let lo = opened_at - Duration::seconds(tolerance_secs);
        let hi = opened_at + Duration::seconds(tolerance_secs);
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM trades
             WHERE user_id = ?1 AND exchange = ?2 AND symbol = ?3
               AND opened_at >= ?4 AND opened_at <= ?5",
            params![user_id, exchange, symbol, ts(lo), ts(hi)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn open_trades(&self, user_id: i64) -> Result<Vec<Trade>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLS} FROM trades
             WHERE user_id = ?1 AND status = 'open'
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([user_id], row_to_trade)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn all_trades(&self, user_id: i64) -> Result<Vec<Trade>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLS} FROM trades WHERE user_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt
            .query_map([user_id], row_to_trade)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Closed trades with a recorded result, newest close first.
    pub fn closed_trades_desc(&self, user_id: i64, limit: usize) -> Result<Vec<Trade>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLS} FROM trades
             WHERE user_id = ?1 AND status = 'closed' AND pnl_percent IS NOT NULL
             ORDER BY closed_at DESC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], row_to_trade)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn set_inferred_reasoning(&self, trade_id: i64, reasoning: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE trades SET inferred_reasoning = ?1 WHERE id = ?2",
            params![reasoning, trade_id],
        )?;
        Ok(())
    }

    /// Single open→closed transition.
    pub fn close_trade(
        &self,
        trade_id: i64,
        exit_price: f64,
        pnl_percent: f64,
        pnl_amount: f64,
        closed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE trades
             SET status = 'closed', exit_price = ?1, pnl_percent = ?2,
                 pnl_amount = ?3, closed_at = ?4
             WHERE id = ?5 AND status = 'open'",
            params![exit_price, pnl_percent, pnl_amount, ts(closed_at), trade_id],
        )?;
        Ok(())
    }

    pub fn count_opens_since(&self, user_id: i64, cutoff: DateTime<Utc>) -> Result<i64> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM trades WHERE user_id = ?1 AND opened_at >= ?2",
            params![user_id, ts(cutoff)],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn set_trade_episode(&self, trade_id: i64, episode_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE trades SET episode_id = ?1 WHERE id = ?2",
            params![episode_id, trade_id],
        )?;
        Ok(())
    }

    /// Most recent trade still waiting for the user's confirm/deny on the
    /// inferred reasoning.
    pub fn latest_unconfirmed_trade(&self, user_id: i64) -> Result<Option<Trade>> {
        let conn = self.conn();
        let trade = conn
            .query_row(
                &format!(
                    "SELECT {TRADE_COLS} FROM trades
                     WHERE user_id = ?1 AND user_confirmed_reasoning IS NULL
                     ORDER BY created_at DESC LIMIT 1"
                ),
                [user_id],
                row_to_trade,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(trade)
    }

    pub fn set_confirmed_reasoning(&self, trade_id: i64, confirmed: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE trades SET user_confirmed_reasoning = ?1 WHERE id = ?2",
            params![confirmed as i64, trade_id],
        )?;
        Ok(())
    }

    /// Most recent trade where the user denied the inference and has not
    /// yet supplied their own reasoning.
    pub fn latest_denied_without_reason(&self, user_id: i64) -> Result<Option<Trade>> {
        let conn = self.conn();
        let trade = conn
            .query_row(
                &format!(
                    "SELECT {TRADE_COLS} FROM trades
                     WHERE user_id = ?1 AND user_confirmed_reasoning = 0
                       AND user_actual_reasoning IS NULL
                     ORDER BY created_at DESC LIMIT 1"
                ),
                [user_id],
                row_to_trade,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(trade)
    }

    pub fn set_actual_reasoning(&self, trade_id: i64, reasoning: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE trades SET user_actual_reasoning = ?1 WHERE id = ?2",
            params![reasoning, trade_id],
        )?;
        Ok(())
    }

    /// (rows with a confirm/deny answer, rows confirmed true) — the
    /// reasoning hit rate inputs for the sync metric.
    pub fn reasoning_confirmation_counts(&self, user_id: i64) -> Result<(i64, i64)> {
        let conn = self.conn();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades
             WHERE user_id = ?1 AND user_confirmed_reasoning IS NOT NULL",
            [user_id],
            |row| row.get(0),
        )?;
        let correct: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades
             WHERE user_id = ?1 AND user_confirmed_reasoning = 1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok((total, correct))
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

    fn sol_buy(opened_at: DateTime<Utc>) -> NewTrade {
        NewTrade {
            exchange: "binance".to_string(),
            symbol: "SOL/USDT".to_string(),
            side: TradeSide::Buy,
            entry_price: 150.0,
            size: 10.0,
            leverage: 1.0,
            opened_at,
        }
    }

    #[test]
    fn duplicate_window_is_ten_seconds() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        store.insert_trade(uid, &sol_buy(now), now).unwrap();

        for offset in [-10, -3, 0, 5, 10] {
            assert!(store
                .duplicate_trade_exists(
                    uid,
                    "binance",
                    "SOL/USDT",
                    now + Duration::seconds(offset),
                    10
                )
                .unwrap());
        }
        assert!(!store
            .duplicate_trade_exists(uid, "binance", "SOL/USDT", now + Duration::seconds(21), 10)
            .unwrap());
        assert!(!store
            .duplicate_trade_exists(uid, "upbit", "SOL/USDT", now, 10)
            .unwrap());
    }

    #[test]
    fn close_is_single_transition() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        let trade = store.insert_trade(uid, &sol_buy(now), now).unwrap();
        assert_eq!(trade.status, TradeStatus::Open);

        store.close_trade(trade.id, 165.0, 10.0, 150.0, now).unwrap();
        let closed = store.trade(trade.id).unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.exit_price, Some(165.0));
        assert_eq!(closed.pnl_percent, Some(10.0));

        // A second close attempt must not overwrite the recorded result.
        store.close_trade(trade.id, 1.0, -99.0, -1.0, now).unwrap();
        let still = store.trade(trade.id).unwrap();
        assert_eq!(still.exit_price, Some(165.0));
    }

    #[test]
    fn closed_trades_order_newest_first() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        for (i, pnl) in [(-5.0), (-4.0), (-6.0)].iter().enumerate() {
            let t = store
                .insert_trade(uid, &sol_buy(now - Duration::hours(10 - i as i64)), now)
                .unwrap();
            store
                .close_trade(t.id, 150.0, *pnl, 0.0, now - Duration::hours(5 - i as i64))
                .unwrap();
        }
        let closed = store.closed_trades_desc(uid, 5).unwrap();
        assert_eq!(closed.len(), 3);
        assert_eq!(closed[0].pnl_percent, Some(-6.0));
        assert_eq!(closed[2].pnl_percent, Some(-5.0));
    }

    #[test]
    fn reasoning_confirmation_flow() {
        let (store, uid) = store_with_user();
        let now = Utc::now();
        let trade = store.insert_trade(uid, &sol_buy(now), now).unwrap();
        store
            .set_inferred_reasoning(trade.id, "펀딩비 음전 구간 진입 패턴")
            .unwrap();

        let pending = store.latest_unconfirmed_trade(uid).unwrap().unwrap();
        assert_eq!(pending.id, trade.id);

        store.set_confirmed_reasoning(trade.id, false).unwrap();
        assert!(store.latest_unconfirmed_trade(uid).unwrap().is_none());

        let denied = store.latest_denied_without_reason(uid).unwrap().unwrap();
        assert_eq!(denied.id, trade.id);
        store
            .set_actual_reasoning(trade.id, "그냥 뉴스 보고 샀어")
            .unwrap();
        assert!(store.latest_denied_without_reason(uid).unwrap().is_none());

        assert_eq!(store.reasoning_confirmation_counts(uid).unwrap(), (1, 0));
    }
}
