use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_ATTACHMENTS, MAX_MESSAGE_SIZE};
use crate::error::ValidationError;
use crate::types::{validate_content_hash, GroupId, MessageId, MsgType, Target, UserId};

/// A request to send one message, as received over HTTP or a socket.
///
/// The recipient is given as two optional fields so that malformed
/// requests (both or neither set) can be rejected explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendRequest {
    #[serde(default)]
    pub to_user_id: Option<UserId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub msg_type: MsgType,
    /// Content hashes of previously uploaded files.
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl SendRequest {
    /// Validate everything that can be checked without the store.
    pub fn validate(&self) -> Result<Target, ValidationError> {
        let target = Target::from_parts(self.to_user_id, self.group_id)?;
        validate_body(&self.content, &self.attachments)?;
        Ok(target)
    }
}

/// Limits shared by every path that creates a message.
pub fn validate_body(content: &str, attachments: &[String]) -> Result<(), ValidationError> {
    if content.is_empty() && attachments.is_empty() {
        return Err(ValidationError::EmptyMessage);
    }
    if content.len() > MAX_MESSAGE_SIZE {
        return Err(ValidationError::ContentTooLarge {
            size: content.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    if attachments.len() > MAX_ATTACHMENTS {
        return Err(ValidationError::TooManyAttachments {
            count: attachments.len(),
            max: MAX_ATTACHMENTS,
        });
    }
    for hash in attachments {
        validate_content_hash(hash)?;
    }
    Ok(())
}

/// The event pushed to every live connection of every recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEvent {
    pub id: MessageId,
    pub from: UserId,
    pub target: Target,
    pub content: String,
    pub msg_type: MsgType,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<String>,
}

/// Frames a client may send over its socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Send(SendRequest),
    Ping,
}

/// Frames the server writes to a client socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message(MessageEvent),
    Ack {
        id: MessageId,
        delivered: bool,
        offline_recipients: usize,
    },
    Error {
        error: String,
    },
    Pong,
}

impl ServerFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
