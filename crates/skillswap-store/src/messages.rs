use chrono::{DateTime, Utc};
use rusqlite::params;

use skillswap_shared::UserId;

use crate::database::{conversion_error, not_found, Database};
use crate::error::Result;
use crate::models::{from_db_timestamp, to_db_timestamp, ChatMessage, ChatPayload};

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, content, file_id, delivered, created_at";

impl Database {
    /// Persist a new message with `delivered = false`.
    pub fn insert_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        payload: &ChatPayload,
        created_at: DateTime<Utc>,
    ) -> Result<ChatMessage> {
        let (content, file_id) = match payload {
            ChatPayload::Text(text) => (Some(text.as_str()), None),
            ChatPayload::File(file_id) => (None, Some(*file_id)),
        };

        self.conn().execute(
            "INSERT INTO messages (sender_id, receiver_id, content, file_id, delivered, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                sender_id.0,
                receiver_id.0,
                content,
                file_id,
                to_db_timestamp(&created_at),
            ],
        )?;

        Ok(ChatMessage {
            id: self.conn().last_insert_rowid(),
            sender_id,
            receiver_id,
            payload: payload.clone(),
            delivered: false,
            created_at,
        })
    }

    pub fn get_message(&self, id: i64) -> Result<ChatMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .map_err(not_found)
    }

    /// Undelivered messages addressed to `receiver_id`, oldest first.
    pub fn pending_messages(&self, receiver_id: UserId) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE receiver_id = ?1 AND delivered = 0
             ORDER BY id ASC"
        ))?;

        let rows = stmt.query_map(params![receiver_id.0], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Mark a batch of messages delivered in one transaction.
    ///
    /// Rows already delivered are left untouched, so the flag flips at most
    /// once. Returns how many rows actually changed.
    pub fn mark_delivered(&mut self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn_mut().transaction()?;
        let mut changed = 0;
        {
            let mut stmt =
                tx.prepare("UPDATE messages SET delivered = 1 WHERE id = ?1 AND delivered = 0")?;
            for id in ids {
                changed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;

        Ok(changed)
    }

    /// Conversation between two users in send order, capped to the most
    /// recent `limit` messages.
    pub fn conversation(&self, a: UserId, b: UserId, limit: u32) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT {MESSAGE_COLUMNS}
                 FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY id DESC
                 LIMIT ?3
             ) ORDER BY id ASC"
        ))?;

        let rows = stmt.query_map(params![a.0, b.0, limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let id: i64 = row.get(0)?;
    let sender_id: i64 = row.get(1)?;
    let receiver_id: i64 = row.get(2)?;
    let content: Option<String> = row.get(3)?;
    let file_id: Option<i64> = row.get(4)?;
    let delivered: i32 = row.get(5)?;
    let ts_str: String = row.get(6)?;

    let payload = match (content, file_id) {
        (_, Some(file_id)) => ChatPayload::File(file_id),
        (Some(text), None) => ChatPayload::Text(text),
        (None, None) => ChatPayload::Text(String::new()),
    };

    let created_at = from_db_timestamp(&ts_str).map_err(|e| conversion_error(6, e))?;

    Ok(ChatMessage {
        id,
        sender_id: UserId(sender_id),
        receiver_id: UserId(receiver_id),
        payload,
        delivered: delivered != 0,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> ChatPayload {
        ChatPayload::Text(s.to_string())
    }

    #[test]
    fn pending_in_send_order() {
        let db = Database::open_in_memory().unwrap();
        for body in ["one", "two", "three"] {
            db.insert_message(UserId(1), UserId(2), &text(body), Utc::now())
                .unwrap();
        }
        db.insert_message(UserId(1), UserId(3), &text("other"), Utc::now())
            .unwrap();

        let pending = db.pending_messages(UserId(2)).unwrap();
        let bodies: Vec<_> = pending.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(bodies, vec![text("one"), text("two"), text("three")]);
        assert!(pending.iter().all(|m| !m.delivered));
    }

    #[test]
    fn mark_delivered_flips_once() {
        let mut db = Database::open_in_memory().unwrap();
        let a = db
            .insert_message(UserId(1), UserId(2), &text("a"), Utc::now())
            .unwrap();
        let b = db
            .insert_message(UserId(1), UserId(2), &ChatPayload::File(77), Utc::now())
            .unwrap();

        assert_eq!(db.mark_delivered(&[a.id, b.id]).unwrap(), 2);
        assert_eq!(db.mark_delivered(&[a.id, b.id]).unwrap(), 0);
        assert!(db.pending_messages(UserId(2)).unwrap().is_empty());

        let stored = db.get_message(b.id).unwrap();
        assert!(stored.delivered);
        assert_eq!(stored.payload, ChatPayload::File(77));
    }

    #[test]
    fn conversation_both_directions() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(UserId(1), UserId(2), &text("hi"), Utc::now())
            .unwrap();
        db.insert_message(UserId(2), UserId(1), &text("hello"), Utc::now())
            .unwrap();
        db.insert_message(UserId(3), UserId(1), &text("noise"), Utc::now())
            .unwrap();
        db.insert_message(UserId(1), UserId(2), &text("bye"), Utc::now())
            .unwrap();

        let all = db.conversation(UserId(2), UserId(1), 50).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].payload, text("hi"));
        assert_eq!(all[2].payload, text("bye"));

        let last_two = db.conversation(UserId(1), UserId(2), 2).unwrap();
        assert_eq!(last_two[0].payload, text("hello"));
        assert_eq!(last_two[1].payload, text("bye"));
    }

    #[test]
    fn missing_message_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_message(999),
            Err(crate::StoreError::NotFound)
        ));
    }
}
