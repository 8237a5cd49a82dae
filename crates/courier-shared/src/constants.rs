/// Maximum message content size in bytes (64 KiB)
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Maximum number of attachments on a single message
pub const MAX_ATTACHMENTS: usize = 16;

/// Maximum attachment size in bytes (50 MiB)
pub const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

/// Length of a hex-encoded BLAKE3 content hash
pub const CONTENT_HASH_HEX_LEN: usize = 64;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Header carrying the authenticated user id, set by the upstream gateway
pub const USER_ID_HEADER: &str = "x-user-id";
