use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::CONTENT_HASH_HEX_LEN;
use crate::error::ValidationError;

// User identity as issued by the auth service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who a message is addressed to. Exactly one peer user or one group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Target {
    Private(UserId),
    Group(GroupId),
}

impl Target {
    /// Build a target from the two optional fields of a send request.
    ///
    /// Both set and neither set are rejected.
    pub fn from_parts(
        to_user_id: Option<UserId>,
        group_id: Option<GroupId>,
    ) -> Result<Self, ValidationError> {
        match (to_user_id, group_id) {
            (Some(user), None) => Ok(Target::Private(user)),
            (None, Some(group)) => Ok(Target::Group(group)),
            (Some(_), Some(_)) => Err(ValidationError::AmbiguousTarget),
            (None, None) => Err(ValidationError::MissingTarget),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Target::Private(_) => TargetKind::Private,
            Target::Group(_) => TargetKind::Group,
        }
    }

    /// Raw id of the peer user or group.
    pub fn id(&self) -> i64 {
        match self {
            Target::Private(user) => user.0,
            Target::Group(group) => group.0,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Private(user) => write!(f, "user:{}", user),
            Target::Group(group) => write!(f, "group:{}", group),
        }
    }
}

/// Conversation type, also the `type` column of conversation rows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Private,
    Group,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Private => "private",
            TargetKind::Group => "group",
        }
    }
}

impl FromStr for TargetKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(TargetKind::Private),
            "group" => Ok(TargetKind::Group),
            other => Err(ValidationError::UnknownVariant {
                kind: "conversation type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    #[default]
    Text,
    Image,
    Voice,
    Video,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Text => "text",
            MsgType::Image => "image",
            MsgType::Voice => "voice",
            MsgType::Video => "video",
        }
    }

    /// Reference type recorded for attachments carried by this kind of message.
    pub fn attachment_ref_type(&self) -> RefType {
        match self {
            MsgType::Text => RefType::ChatFile,
            MsgType::Image => RefType::ChatImage,
            MsgType::Voice => RefType::ChatVoice,
            MsgType::Video => RefType::ChatVideo,
        }
    }
}

impl FromStr for MsgType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MsgType::Text),
            "image" => Ok(MsgType::Image),
            "voice" => Ok(MsgType::Voice),
            "video" => Ok(MsgType::Video),
            other => Err(ValidationError::UnknownVariant {
                kind: "message type",
                value: other.to_string(),
            }),
        }
    }
}

/// What a file reference is used for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    Avatar,
    ChatImage,
    ChatVoice,
    ChatVideo,
    ChatFile,
}

impl RefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefType::Avatar => "avatar",
            RefType::ChatImage => "chat_image",
            RefType::ChatVoice => "chat_voice",
            RefType::ChatVideo => "chat_video",
            RefType::ChatFile => "chat_file",
        }
    }
}

impl FromStr for RefType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avatar" => Ok(RefType::Avatar),
            "chat_image" => Ok(RefType::ChatImage),
            "chat_voice" => Ok(RefType::ChatVoice),
            "chat_video" => Ok(RefType::ChatVideo),
            "chat_file" => Ok(RefType::ChatFile),
            other => Err(ValidationError::UnknownVariant {
                kind: "reference type",
                value: other.to_string(),
            }),
        }
    }
}

/// Check that `hash` looks like a lowercase hex BLAKE3 digest.
pub fn validate_content_hash(hash: &str) -> Result<(), ValidationError> {
    let well_formed = hash.len() == CONTENT_HASH_HEX_LEN
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::InvalidHash(hash.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_requires_exactly_one_side() {
        assert_eq!(
            Target::from_parts(Some(UserId(2)), None),
            Ok(Target::Private(UserId(2)))
        );
        assert_eq!(
            Target::from_parts(None, Some(GroupId(9))),
            Ok(Target::Group(GroupId(9)))
        );
        assert_eq!(
            Target::from_parts(Some(UserId(2)), Some(GroupId(9))),
            Err(ValidationError::AmbiguousTarget)
        );
        assert_eq!(
            Target::from_parts(None, None),
            Err(ValidationError::MissingTarget)
        );
    }

    #[test]
    fn target_wire_shape() {
        let json = serde_json::to_value(Target::Group(GroupId(4))).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "group", "id": 4 }));
    }

    #[test]
    fn enum_names_parse_back() {
        for kind in ["private", "group"] {
            assert_eq!(kind.parse::<TargetKind>().unwrap().as_str(), kind);
        }
        for ty in ["text", "image", "voice", "video"] {
            assert_eq!(ty.parse::<MsgType>().unwrap().as_str(), ty);
        }
        assert!("sticker".parse::<MsgType>().is_err());
        assert_eq!("chat_image".parse::<RefType>().unwrap(), RefType::ChatImage);
    }

    #[test]
    fn hash_validation() {
        assert!(validate_content_hash(&"ab".repeat(32)).is_ok());
        assert!(validate_content_hash("abcd").is_err());
        assert!(validate_content_hash(&"AB".repeat(32)).is_err());
        assert!(validate_content_hash(&"../".repeat(22)[..64]).is_err());
    }
}
