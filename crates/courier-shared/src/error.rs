use thiserror::Error;

/// A request rejected before any persistence work begins.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message target must name either a user or a group, not both")]
    AmbiguousTarget,

    #[error("Message target is missing: set exactly one of to_user_id or group_id")]
    MissingTarget,

    #[error("Message has neither content nor attachments")]
    EmptyMessage,

    #[error("Message content too large: {size} bytes (max {max})")]
    ContentTooLarge { size: usize, max: usize },

    #[error("Too many attachments: {count} (max {max})")]
    TooManyAttachments { count: usize, max: usize },

    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("User {user} is not a member of group {group}")]
    NotGroupMember { user: i64, group: i64 },

    #[error("Group {0} has no members")]
    EmptyGroup(i64),
}
