//! Domain model structs persisted in the database.
//!
//! Every struct derives `Serialize` so it can be returned directly from the
//! HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::protocol::MessageEvent;
use courier_shared::{MessageId, MsgType, RefType, Target, TargetKind, UserId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub from_user_id: UserId,
    /// Exactly one peer user or group.
    pub target: Target,
    pub content: String,
    pub msg_type: MsgType,
    pub created_at: DateTime<Utc>,
    /// Content hashes of the files attached to this message.
    pub attachments: Vec<String>,
}

impl Message {
    /// The event pushed to recipients' live connections.
    pub fn to_event(&self) -> MessageEvent {
        MessageEvent {
            id: self.id,
            from: self.from_user_id,
            target: self.target,
            content: self.content.clone(),
            msg_type: self.msg_type,
            created_at: self.created_at,
            attachments: self.attachments.clone(),
        }
    }
}

/// Input to [`Database::post_message`](crate::Database::post_message).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from_user_id: UserId,
    pub target: Target,
    pub content: String,
    pub msg_type: MsgType,
    pub attachments: Vec<String>,
}

/// A committed message together with the recipient snapshot taken inside
/// the same transaction. The sender is never among the recipients.
#[derive(Debug, Clone)]
pub struct PostedMessage {
    pub message: Message,
    pub recipients: Vec<UserId>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// One participant's summary view of a chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub user_id: UserId,
    pub conv_type: TargetKind,
    pub target_id: i64,
    pub last_msg_id: Option<MessageId>,
    pub unread_count: i64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// The single physical record for a unique byte sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileStorage {
    pub id: i64,
    /// Hex BLAKE3 digest of the bytes.
    pub hash: String,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub storage_path: String,
    pub ref_count: i64,
    /// When `ref_count` last dropped to zero (or the upload time if it was
    /// never referenced). `None` while references exist.
    pub zero_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Metadata for a blob about to be inserted.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub hash: String,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub storage_path: String,
}

/// One logical use of a stored file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileReference {
    pub id: i64,
    pub file_id: i64,
    pub user_id: UserId,
    pub ref_type: RefType,
    pub ref_id: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Result of a single reclaim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Bytes and row deleted.
    Reclaimed,
    /// The row was re-referenced, already gone, or not yet past grace.
    Skipped,
}
