//! # courier-shared
//!
//! Types shared between the store and the server: identifiers, message
//! targeting, the wire protocol spoken over client connections, and the
//! validation errors raised before anything touches persistence.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ValidationError;
pub use types::{GroupId, MessageId, MsgType, RefType, Target, TargetKind, UserId};
