//! The conversation ledger: message persistence and the summary rows that
//! must agree with it.
//!
//! [`Database::post_message`] is the only write path for messages. It runs as
//! a single `IMMEDIATE` transaction covering the recipient snapshot, the
//! message row, its attachment list and references, and every conversation
//! upsert; any error drops the transaction and nothing is written.
//!
//! Messages are immutable. The attachment list is stored with the message
//! and read back verbatim; the file references created alongside it only
//! keep the bytes alive.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use courier_shared::protocol::validate_body;
use courier_shared::{GroupId, MessageId, Target, TargetKind, UserId, ValidationError};

use crate::conversations;
use crate::database::{format_ts, now_ts, parse_enum, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::files;
use crate::groups;
use crate::models::{Message, NewMessage, PostedMessage};

const MESSAGE_COLUMNS: &str = "id, from_user_id, to_user_id, group_id, content, msg_type, created_at";

impl Database {
    /// Persist a message and update every participant's conversation.
    ///
    /// The returned recipients exclude the sender; for group messages they
    /// are the membership at commit time.
    pub fn post_message(&mut self, new: &NewMessage) -> Result<PostedMessage> {
        validate_body(&new.content, &new.attachments)?;

        let now = now_ts();
        let from = new.from_user_id;
        let tx = self.write_tx()?;

        let recipients = resolve_recipients(&tx, from, new.target)?;

        let (to_user, group) = match new.target {
            Target::Private(user) => (Some(user.0), None),
            Target::Group(group) => (None, Some(group.0)),
        };
        tx.execute(
            "INSERT INTO messages (from_user_id, to_user_id, group_id, content, msg_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                from.0,
                to_user,
                group,
                new.content,
                new.msg_type.as_str(),
                format_ts(&now),
            ],
        )?;
        let id = MessageId(tx.last_insert_rowid());

        let ref_type = new.msg_type.attachment_ref_type();
        for (position, hash) in new.attachments.iter().enumerate() {
            files::add_reference_in(&tx, hash, from, ref_type, id.0, &now)?;
            tx.execute(
                "INSERT INTO message_attachments (message_id, position, hash) VALUES (?1, ?2, ?3)",
                params![id.0, position as i64, hash],
            )?;
        }

        let kind = new.target.kind();
        conversations::upsert_in(&tx, from, kind, new.target.id(), id, 0, &now)?;
        for recipient in &recipients {
            // A recipient's view of a private chat is keyed by the sender.
            let target_id = match new.target {
                Target::Private(_) => from.0,
                Target::Group(group) => group.0,
            };
            conversations::upsert_in(&tx, *recipient, kind, target_id, id, 1, &now)?;
        }

        tx.commit()?;

        tracing::debug!(
            message = %id,
            from = %from,
            target = %new.target,
            recipients = recipients.len(),
            attachments = new.attachments.len(),
            "message persisted"
        );

        Ok(PostedMessage {
            message: Message {
                id,
                from_user_id: from,
                target: new.target,
                content: new.content.clone(),
                msg_type: new.msg_type,
                created_at: now,
                attachments: new.attachments.clone(),
            },
            recipients,
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        let message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.0],
                row_to_message,
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        with_attachments(self.conn(), message)
    }

    /// Page backwards through the history `viewer` sees for a conversation.
    ///
    /// Returns at most `limit` messages with ids below `before` (if given),
    /// newest first.
    pub fn message_history(
        &self,
        viewer: UserId,
        kind: TargetKind,
        target_id: i64,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let before = before.map(|id| id.0).unwrap_or(i64::MAX);
        let conn = self.conn();

        let found: Vec<Message> = match kind {
            TargetKind::Private => conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE ((from_user_id = ?1 AND to_user_id = ?2)
                         OR (from_user_id = ?2 AND to_user_id = ?1))
                       AND id < ?3
                     ORDER BY id DESC
                     LIMIT ?4"
                ))?
                .query_map(params![viewer.0, target_id, before, limit], row_to_message)?
                .collect::<rusqlite::Result<_>>()?,
            TargetKind::Group => conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE group_id = ?1 AND id < ?2
                     ORDER BY id DESC
                     LIMIT ?3"
                ))?
                .query_map(params![target_id, before, limit], row_to_message)?
                .collect::<rusqlite::Result<_>>()?,
        };

        found
            .into_iter()
            .map(|message| with_attachments(conn, message))
            .collect()
    }
}

/// Everyone who should see the message, excluding the sender.
fn resolve_recipients(conn: &Connection, from: UserId, target: Target) -> Result<Vec<UserId>> {
    match target {
        Target::Private(to) if to == from => Ok(Vec::new()),
        Target::Private(to) => Ok(vec![to]),
        Target::Group(group) => {
            let members = groups::members_in(conn, group)?;
            if members.is_empty() {
                return Err(ValidationError::EmptyGroup(group.0).into());
            }
            if !members.contains(&from) {
                return Err(ValidationError::NotGroupMember {
                    user: from.0,
                    group: group.0,
                }
                .into());
            }
            Ok(members.into_iter().filter(|member| *member != from).collect())
        }
    }
}

fn with_attachments(conn: &Connection, mut message: Message) -> Result<Message> {
    message.attachments = conn
        .prepare_cached(
            "SELECT hash FROM message_attachments
             WHERE message_id = ?1
             ORDER BY position ASC",
        )?
        .query_map(params![message.id.0], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(message)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let to_user: Option<i64> = row.get(2)?;
    let group: Option<i64> = row.get(3)?;
    let msg_type: String = row.get(5)?;
    let created_str: String = row.get(6)?;

    let target = match (to_user, group) {
        (Some(user), None) => Target::Private(UserId(user)),
        (None, Some(group)) => Target::Group(GroupId(group)),
        _ => {
            let err = ValidationError::AmbiguousTarget;
            return Err(rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Integer,
                Box::new(err),
            ));
        }
    };
    let created_at: DateTime<Utc> = parse_ts(&created_str, 6)?;

    Ok(Message {
        id: MessageId(row.get(0)?),
        from_user_id: UserId(row.get(1)?),
        target,
        content: row.get(4)?,
        msg_type: parse_enum(&msg_type, 5)?,
        created_at,
        attachments: Vec::new(),
    })
}
