//! Per-user conversation summaries.
//!
//! Each participant owns one row per (type, target). The ledger writes them
//! through [`upsert_in`]; reading and marking as read are ordinary
//! single-statement operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use courier_shared::{MessageId, TargetKind, UserId};

use crate::database::{format_ts, now_ts, parse_enum, parse_ts, Database};
use crate::error::Result;
use crate::models::Conversation;

/// Create the row if absent, otherwise point it at `last_msg` and add
/// `unread_increment` (0 for the sender's own view, 1 for a recipient).
pub fn upsert_in(
    conn: &Connection,
    owner: UserId,
    kind: TargetKind,
    target_id: i64,
    last_msg: MessageId,
    unread_increment: i64,
    now: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations (user_id, conv_type, target_id, last_msg_id, unread_count, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(user_id, conv_type, target_id) DO UPDATE SET
             last_msg_id  = excluded.last_msg_id,
             unread_count = unread_count + excluded.unread_count,
             updated_at   = excluded.updated_at",
        params![
            owner.0,
            kind.as_str(),
            target_id,
            last_msg.0,
            unread_increment,
            format_ts(now),
        ],
    )?;
    Ok(())
}

impl Database {
    pub fn get_conversation(
        &self,
        owner: UserId,
        kind: TargetKind,
        target_id: i64,
    ) -> Result<Option<Conversation>> {
        let conversation = self
            .conn()
            .query_row(
                "SELECT user_id, conv_type, target_id, last_msg_id, unread_count, updated_at
                 FROM conversations
                 WHERE user_id = ?1 AND conv_type = ?2 AND target_id = ?3",
                params![owner.0, kind.as_str(), target_id],
                row_to_conversation,
            )
            .optional()?;
        Ok(conversation)
    }

    /// All of a user's conversations, most recently active first.
    pub fn list_conversations(&self, owner: UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, conv_type, target_id, last_msg_id, unread_count, updated_at
             FROM conversations
             WHERE user_id = ?1
             ORDER BY updated_at DESC, last_msg_id DESC",
        )?;
        let rows = stmt.query_map(params![owner.0], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// Reset the unread counter. Returns `false` if the conversation does not
    /// exist.
    pub fn mark_read(&self, owner: UserId, kind: TargetKind, target_id: i64) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE conversations SET unread_count = 0, updated_at = ?4
             WHERE user_id = ?1 AND conv_type = ?2 AND target_id = ?3",
            params![owner.0, kind.as_str(), target_id, format_ts(&now_ts())],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let kind: String = row.get(1)?;
    let last_msg: Option<i64> = row.get(3)?;
    let updated_str: String = row.get(5)?;

    Ok(Conversation {
        user_id: UserId(row.get(0)?),
        conv_type: parse_enum(&kind, 1)?,
        target_id: row.get(2)?,
        last_msg_id: last_msg.map(MessageId),
        unread_count: row.get(4)?,
        updated_at: parse_ts(&updated_str, 5)?,
    })
}
