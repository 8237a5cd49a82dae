//! v002 -- Attachment lists stored with their message.
//!
//! A message's attachments are fixed when it is posted. References in
//! `file_references` only keep the bytes alive; they do not describe the
//! message.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS message_attachments (
    message_id INTEGER NOT NULL,
    position   INTEGER NOT NULL,
    hash       TEXT NOT NULL,

    PRIMARY KEY (message_id, position),
    FOREIGN KEY (message_id) REFERENCES messages(id)
);
"#;

/// Apply the attachment list migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
