use chrono::{DateTime, Utc};
use rusqlite::params;

use pulse_core::types::MessageRole;

use super::{col_to_json, parse_ts, ts, Store};
use crate::error::Result;
use crate::types::{ChatMessage, NewMessage};

const MESSAGE_COLS: &str =
    "id, user_id, role, content, message_type, intent, metadata, external_message_id, created_at";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        user_id: row.get(1)?,
        role: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or(MessageRole::Assistant),
        content: row.get(3)?,
        message_type: row.get(4)?,
        intent: row.get(5)?,
        metadata: col_to_json(row.get(6)?),
        external_message_id: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?),
    })
}

impl Store {
    pub fn insert_message(
        &self,
        user_id: i64,
        new: &NewMessage,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO chat_messages
               (user_id, role, content, message_type, intent, metadata, created_at)
             VALUES (?1, ?2, ?3, 'text', ?4, ?5, ?6)",
            params![
                user_id,
                new.role.to_string(),
                new.content,
                new.intent,
                new.metadata.as_ref().map(|v| v.to_string()),
                ts(now)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The last `limit` messages in chronological order.
    pub fn recent_messages(&self, user_id: i64, limit: usize) -> Result<Vec<ChatMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM chat_messages
             WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let mut rows: Vec<ChatMessage> = stmt
            .query_map(params![user_id, limit as i64], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        rows.reverse();
        Ok(rows)
    }

    pub fn count_user_messages_since(
        &self,
        user_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<i64> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM chat_messages
             WHERE user_id = ?1 AND role = 'user' AND created_at >= ?2",
            params![user_id, ts(cutoff)],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn recent_messages_are_chronological() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let user = store.create_user("u", None, "ko", now).unwrap();

        for (i, text) in ["first", "second", "third"].iter().enumerate() {
            store
                .insert_message(
                    user.id,
                    &NewMessage::assistant(*text, "general"),
                    now + Duration::seconds(i as i64),
                )
                .unwrap();
        }

        let msgs = store.recent_messages(user.id, 2).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "second");
        assert_eq!(msgs[1].content, "third");
    }

    #[test]
    fn user_message_count_window() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let user = store.create_user("u", None, "ko", now).unwrap();

        let mut user_msg = NewMessage::assistant("안녕", "general");
        user_msg.role = MessageRole::User;
        store
            .insert_message(user.id, &user_msg, now - Duration::days(10))
            .unwrap();
        store.insert_message(user.id, &user_msg, now).unwrap();
        store
            .insert_message(user.id, &NewMessage::assistant("답", "general"), now)
            .unwrap();

        let count = store
            .count_user_messages_since(user.id, now - Duration::days(7))
            .unwrap();
        assert_eq!(count, 1);
    }
}
