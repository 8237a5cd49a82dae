//! Group membership, as maintained by the membership service.
//!
//! The delivery engine only reads this table, and always inside the message
//! transaction so that the recipient set is a consistent snapshot.

use rusqlite::{params, Connection};

use courier_shared::{GroupId, UserId};

use crate::database::{format_ts, now_ts, Database};
use crate::error::Result;

/// Members of `group`, ordered by user id.
pub fn members_in(conn: &Connection, group: GroupId) -> Result<Vec<UserId>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id ASC")?;
    let rows = stmt.query_map(params![group.0], |row| row.get::<_, i64>(0))?;

    let mut members = Vec::new();
    for row in rows {
        members.push(UserId(row?));
    }
    Ok(members)
}

impl Database {
    /// Add `user` to `group`. Returns `false` if already a member.
    pub fn add_group_member(&self, group: GroupId, user: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
            params![group.0, user.0, format_ts(&now_ts())],
        )?;
        Ok(affected > 0)
    }

    /// Remove `user` from `group`. Returns `true` if a row was deleted.
    pub fn remove_group_member(&self, group: GroupId, user: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group.0, user.0],
        )?;
        Ok(affected > 0)
    }

    pub fn group_members(&self, group: GroupId) -> Result<Vec<UserId>> {
        members_in(self.conn(), group)
    }
}
