//! v001 -- Initial schema creation.
//!
//! Messages, per-user conversation summaries, content-addressed file
//! storage with its references, and group membership.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages (immutable)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    from_user_id INTEGER NOT NULL,
    to_user_id   INTEGER,
    group_id     INTEGER,
    content      TEXT NOT NULL,
    msg_type     TEXT NOT NULL,               -- text | image | voice | video
    created_at   TEXT NOT NULL,               -- RFC-3339, fixed width

    CHECK ((to_user_id IS NULL) <> (group_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_messages_private
    ON messages(from_user_id, to_user_id, id);
CREATE INDEX IF NOT EXISTS idx_messages_group
    ON messages(group_id, id);

-- ----------------------------------------------------------------
-- Conversations (one inbox row per owner and target)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    user_id      INTEGER NOT NULL,
    conv_type    TEXT NOT NULL,               -- private | group
    target_id    INTEGER NOT NULL,
    last_msg_id  INTEGER,                     -- weak reference, no FK
    unread_count INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
    updated_at   TEXT NOT NULL,

    PRIMARY KEY (user_id, conv_type, target_id)
);

-- ----------------------------------------------------------------
-- File storage (one row per unique byte sequence)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS file_storage (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    hash         TEXT NOT NULL UNIQUE,        -- hex BLAKE3
    file_name    TEXT NOT NULL,
    file_size    INTEGER NOT NULL,
    mime_type    TEXT NOT NULL,
    storage_path TEXT NOT NULL,
    ref_count    INTEGER NOT NULL DEFAULT 0 CHECK (ref_count >= 0),
    zero_since   TEXT,                        -- set while ref_count = 0
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_storage_reclaim
    ON file_storage(ref_count, zero_since);

-- ----------------------------------------------------------------
-- File references (one row per logical use, soft-deleted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS file_references (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id    INTEGER NOT NULL,
    user_id    INTEGER NOT NULL,
    ref_type   TEXT NOT NULL,                 -- avatar | chat_image | ...
    ref_id     INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    deleted_at TEXT,

    FOREIGN KEY (file_id) REFERENCES file_storage(id)
);

CREATE INDEX IF NOT EXISTS idx_file_references_file
    ON file_references(file_id, deleted_at);
CREATE INDEX IF NOT EXISTS idx_file_references_owner
    ON file_references(ref_type, ref_id, deleted_at);

-- ----------------------------------------------------------------
-- Group membership (written by the membership service)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_members (
    group_id  INTEGER NOT NULL,
    user_id   INTEGER NOT NULL,
    joined_at TEXT NOT NULL,

    PRIMARY KEY (group_id, user_id)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
