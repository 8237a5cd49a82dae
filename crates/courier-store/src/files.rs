//! Content-addressed file bookkeeping: [`FileStorage`] rows keyed by hash and
//! the [`FileReference`] rows that keep them alive.
//!
//! Every function that changes `file_storage.ref_count` also inserts or
//! soft-deletes the matching reference, on the same connection, so callers
//! that pass a transaction get both writes committed or rolled back together.
//! The `*_in` free functions exist so the ledger can run them inside its own
//! message transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use courier_shared::{RefType, UserId};

use crate::database::{format_ts, now_ts, parse_enum, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{FileReference, FileStorage, NewFile, ReclaimOutcome};

const FILE_COLUMNS: &str = "id, hash, file_name, file_size, mime_type, storage_path, ref_count, zero_since, created_at";

const REFERENCE_COLUMNS: &str = "id, file_id, user_id, ref_type, ref_id, created_at, deleted_at";

// ---------------------------------------------------------------------------
// Transaction-scoped helpers
// ---------------------------------------------------------------------------

pub fn find_by_hash_in(conn: &Connection, hash: &str) -> Result<Option<FileStorage>> {
    let file = conn
        .query_row(
            &format!("SELECT {FILE_COLUMNS} FROM file_storage WHERE hash = ?1"),
            params![hash],
            row_to_file,
        )
        .optional()?;
    Ok(file)
}

/// Record one more logical use of the file with `hash`.
///
/// Fails with [`StoreError::UnknownAttachment`] if no file has that hash.
pub fn add_reference_in(
    conn: &Connection,
    hash: &str,
    user_id: UserId,
    ref_type: RefType,
    ref_id: i64,
    now: &DateTime<Utc>,
) -> Result<i64> {
    let file_id: i64 = conn
        .query_row(
            "SELECT id FROM file_storage WHERE hash = ?1",
            params![hash],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::UnknownAttachment(hash.to_string()))?;

    conn.execute(
        "INSERT INTO file_references (file_id, user_id, ref_type, ref_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![file_id, user_id.0, ref_type.as_str(), ref_id, format_ts(now)],
    )?;
    let reference_id = conn.last_insert_rowid();

    conn.execute(
        "UPDATE file_storage SET ref_count = ref_count + 1, zero_since = NULL WHERE id = ?1",
        params![file_id],
    )?;

    tracing::debug!(
        hash,
        reference = reference_id,
        ref_type = ref_type.as_str(),
        ref_id,
        "file reference added"
    );
    Ok(reference_id)
}

/// Soft-delete a reference and release its count.
///
/// Returns `false` if the reference does not exist or was already removed.
pub fn remove_reference_in(conn: &Connection, reference_id: i64, now: &DateTime<Utc>) -> Result<bool> {
    let stamp = format_ts(now);
    let affected = conn.execute(
        "UPDATE file_references SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        params![stamp, reference_id],
    )?;
    if affected == 0 {
        return Ok(false);
    }

    // SET expressions see the pre-update ref_count.
    conn.execute(
        "UPDATE file_storage
         SET ref_count = ref_count - 1,
             zero_since = CASE WHEN ref_count = 1 THEN ?1 ELSE zero_since END
         WHERE id = (SELECT file_id FROM file_references WHERE id = ?2)",
        params![stamp, reference_id],
    )?;

    tracing::debug!(reference = reference_id, "file reference removed");
    Ok(true)
}

pub fn live_reference_count_in(conn: &Connection, file_id: i64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM file_references WHERE file_id = ?1 AND deleted_at IS NULL",
        params![file_id],
        |row| row.get(0),
    )?)
}

// ---------------------------------------------------------------------------
// Database API
// ---------------------------------------------------------------------------

impl Database {
    pub fn find_file_by_hash(&self, hash: &str) -> Result<Option<FileStorage>> {
        find_by_hash_in(self.conn(), hash)
    }

    /// Insert the row for newly stored bytes.
    ///
    /// A fresh file starts unreferenced (`ref_count = 0`, `zero_since = now`)
    /// so it becomes reclaimable after the grace period unless something
    /// references it. If a row for the hash already exists it is returned
    /// untouched.
    pub fn insert_file(&mut self, file: &NewFile) -> Result<FileStorage> {
        let now = format_ts(&now_ts());
        let tx = self.write_tx()?;
        tx.execute(
            "INSERT INTO file_storage
                 (hash, file_name, file_size, mime_type, storage_path, ref_count, zero_since, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
             ON CONFLICT(hash) DO NOTHING",
            params![
                file.hash,
                file.file_name,
                file.file_size,
                file.mime_type,
                file.storage_path,
                now,
            ],
        )?;
        let stored = find_by_hash_in(&tx, &file.hash)?.ok_or(StoreError::NotFound)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Restart the grace period of an unreferenced file.
    ///
    /// Called when the same bytes are uploaded again: the uploader is about
    /// to reference the file, so it must not be reclaimed on the strength of
    /// an older `zero_since`. Referenced files are returned unchanged.
    pub fn refresh_unreferenced(&mut self, file_id: i64) -> Result<FileStorage> {
        let now = format_ts(&now_ts());
        let tx = self.write_tx()?;
        tx.execute(
            "UPDATE file_storage SET zero_since = ?1 WHERE id = ?2 AND ref_count = 0",
            params![now, file_id],
        )?;
        let file = tx
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM file_storage WHERE id = ?1"),
                params![file_id],
                row_to_file,
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        tx.commit()?;
        Ok(file)
    }

    pub fn add_reference(
        &mut self,
        hash: &str,
        user_id: UserId,
        ref_type: RefType,
        ref_id: i64,
    ) -> Result<i64> {
        let now = now_ts();
        let tx = self.write_tx()?;
        let id = add_reference_in(&tx, hash, user_id, ref_type, ref_id, &now)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn remove_reference(&mut self, reference_id: i64) -> Result<bool> {
        let now = now_ts();
        let tx = self.write_tx()?;
        let removed = remove_reference_in(&tx, reference_id, &now)?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn get_reference(&self, reference_id: i64) -> Result<FileReference> {
        self.conn()
            .query_row(
                &format!("SELECT {REFERENCE_COLUMNS} FROM file_references WHERE id = ?1"),
                params![reference_id],
                row_to_reference,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Live references to the file with `hash`, oldest first.
    pub fn live_references(&self, hash: &str) -> Result<Vec<FileReference>> {
        let mut stmt = self.conn().prepare(
            "SELECT r.id, r.file_id, r.user_id, r.ref_type, r.ref_id, r.created_at, r.deleted_at
             FROM file_references r
             JOIN file_storage f ON f.id = r.file_id
             WHERE f.hash = ?1 AND r.deleted_at IS NULL
             ORDER BY r.id ASC",
        )?;
        let rows = stmt.query_map(params![hash], row_to_reference)?;

        let mut references = Vec::new();
        for row in rows {
            references.push(row?);
        }
        Ok(references)
    }

    /// Point the user's avatar at `hash`, releasing the previous avatar.
    ///
    /// Returns the id of the new reference.
    pub fn set_avatar(&mut self, user_id: UserId, hash: &str) -> Result<i64> {
        let now = now_ts();
        let tx = self.write_tx()?;

        let previous: Vec<i64> = tx
            .prepare(
                "SELECT id FROM file_references
                 WHERE ref_type = ?1 AND ref_id = ?2 AND deleted_at IS NULL",
            )?
            .query_map(params![RefType::Avatar.as_str(), user_id.0], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        // Add before removing so that re-setting the same avatar never
        // passes through ref_count = 0.
        let reference = add_reference_in(&tx, hash, user_id, RefType::Avatar, user_id.0, &now)?;
        for old in previous {
            remove_reference_in(&tx, old, &now)?;
        }

        tx.commit()?;
        Ok(reference)
    }

    /// The user's current avatar, if any.
    pub fn avatar_for(&self, user_id: UserId) -> Result<Option<FileStorage>> {
        let file = self
            .conn()
            .query_row(
                "SELECT f.id, f.hash, f.file_name, f.file_size, f.mime_type, f.storage_path,
                        f.ref_count, f.zero_since, f.created_at
                 FROM file_references r
                 JOIN file_storage f ON f.id = r.file_id
                 WHERE r.ref_type = ?1 AND r.ref_id = ?2 AND r.deleted_at IS NULL
                 ORDER BY r.id DESC
                 LIMIT 1",
                params![RefType::Avatar.as_str(), user_id.0],
                row_to_file,
            )
            .optional()?;
        Ok(file)
    }

    /// Files with no live references whose count reached zero at or before
    /// `cutoff`.
    pub fn reclaim_candidates(&self, cutoff: &DateTime<Utc>, limit: u32) -> Result<Vec<FileStorage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM file_storage
             WHERE ref_count = 0 AND zero_since IS NOT NULL AND zero_since <= ?1
             ORDER BY zero_since ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![format_ts(cutoff), limit], row_to_file)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// Delete one unreferenced file: first its bytes, then its rows.
    ///
    /// The reclaim condition is re-checked inside the transaction, so a file
    /// that was referenced again since it was listed is skipped. A mismatch
    /// between `ref_count` and the live reference count aborts this file
    /// with [`StoreError::Integrity`] and deletes nothing. If `delete_bytes`
    /// fails the transaction rolls back and the row stays for the next
    /// sweep; a file already missing on disk is not an error.
    pub fn reclaim_file<F>(
        &mut self,
        file_id: i64,
        cutoff: &DateTime<Utc>,
        delete_bytes: F,
    ) -> Result<ReclaimOutcome>
    where
        F: FnOnce(&str) -> std::io::Result<()>,
    {
        let tx = self.write_tx()?;

        let file = tx
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM file_storage WHERE id = ?1"),
                params![file_id],
                row_to_file,
            )
            .optional()?;
        let Some(file) = file else {
            return Ok(ReclaimOutcome::Skipped);
        };

        let live = live_reference_count_in(&tx, file.id)?;
        if live != file.ref_count {
            return Err(StoreError::Integrity {
                hash: file.hash,
                ref_count: file.ref_count,
                live,
            });
        }

        let past_grace = file.zero_since.map(|since| since <= *cutoff).unwrap_or(false);
        if file.ref_count != 0 || !past_grace {
            return Ok(ReclaimOutcome::Skipped);
        }

        match delete_bytes(&file.storage_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(hash = %file.hash, path = %file.storage_path, "blob already missing on disk");
            }
            Err(e) => return Err(StoreError::Io(e)),
        }

        tx.execute("DELETE FROM file_references WHERE file_id = ?1", params![file.id])?;
        tx.execute("DELETE FROM file_storage WHERE id = ?1", params![file.id])?;
        tx.commit()?;

        tracing::debug!(hash = %file.hash, "file reclaimed");
        Ok(ReclaimOutcome::Reclaimed)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileStorage> {
    let zero_since: Option<String> = row.get(7)?;
    let created_str: String = row.get(8)?;

    Ok(FileStorage {
        id: row.get(0)?,
        hash: row.get(1)?,
        file_name: row.get(2)?,
        file_size: row.get(3)?,
        mime_type: row.get(4)?,
        storage_path: row.get(5)?,
        ref_count: row.get(6)?,
        zero_since: zero_since.map(|s| parse_ts(&s, 7)).transpose()?,
        created_at: parse_ts(&created_str, 8)?,
    })
}

fn row_to_reference(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileReference> {
    let ref_type: String = row.get(3)?;
    let created_str: String = row.get(5)?;
    let deleted: Option<String> = row.get(6)?;

    Ok(FileReference {
        id: row.get(0)?,
        file_id: row.get(1)?,
        user_id: UserId(row.get(2)?),
        ref_type: parse_enum(&ref_type, 3)?,
        ref_id: row.get(4)?,
        created_at: parse_ts(&created_str, 5)?,
        deleted_at: deleted.map(|s| parse_ts(&s, 6)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_db;
    use chrono::Duration;

    fn new_file(hash: &str) -> NewFile {
        NewFile {
            hash: hash.to_string(),
            file_name: "cat.png".into(),
            file_size: 3,
            mime_type: "image/png".into(),
            storage_path: format!("/blobs/{hash}"),
        }
    }

    fn hash(n: u8) -> String {
        format!("{:02x}", n).repeat(32)
    }

    fn assert_counts_agree(db: &Database, h: &str) {
        let file = db.find_file_by_hash(h).unwrap().unwrap();
        let live = live_reference_count_in(db.conn(), file.id).unwrap();
        assert_eq!(file.ref_count, live);
    }

    #[test]
    fn insert_is_idempotent_per_hash() {
        let (mut db, _dir) = test_db();
        let first = db.insert_file(&new_file(&hash(1))).unwrap();
        let second = db.insert_file(&new_file(&hash(1))).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.ref_count, 0);
        assert!(first.zero_since.is_some());
    }

    #[test]
    fn refresh_restarts_grace_only_when_unreferenced() {
        let (mut db, _dir) = test_db();
        let (idle, held) = (hash(10), hash(11));
        let idle_file = db.insert_file(&new_file(&idle)).unwrap();
        let held_file = db.insert_file(&new_file(&held)).unwrap();
        db.add_reference(&held, UserId(1), RefType::ChatImage, 1).unwrap();

        let long_ago = format_ts(&(Utc::now() - Duration::days(1)));
        db.conn()
            .execute(
                "UPDATE file_storage SET zero_since = ?1 WHERE id = ?2",
                params![long_ago, idle_file.id],
            )
            .unwrap();
        let cutoff = Utc::now() - Duration::hours(1);
        assert_eq!(db.reclaim_candidates(&cutoff, 10).unwrap().len(), 1);

        let refreshed = db.refresh_unreferenced(idle_file.id).unwrap();
        assert_eq!(refreshed.ref_count, 0);
        assert!(refreshed.zero_since.unwrap() > cutoff);
        assert!(db.reclaim_candidates(&cutoff, 10).unwrap().is_empty());

        let untouched = db.refresh_unreferenced(held_file.id).unwrap();
        assert_eq!(untouched.ref_count, 1);
        assert!(untouched.zero_since.is_none());

        assert!(matches!(db.refresh_unreferenced(999), Err(StoreError::NotFound)));
    }

    #[test]
    fn references_move_the_count() {
        let (mut db, _dir) = test_db();
        let h = hash(2);
        db.insert_file(&new_file(&h)).unwrap();

        let a = db.add_reference(&h, UserId(1), RefType::ChatImage, 10).unwrap();
        let b = db.add_reference(&h, UserId(2), RefType::ChatImage, 11).unwrap();
        let file = db.find_file_by_hash(&h).unwrap().unwrap();
        assert_eq!(file.ref_count, 2);
        assert!(file.zero_since.is_none());
        assert_counts_agree(&db, &h);

        assert!(db.remove_reference(a).unwrap());
        assert!(!db.remove_reference(a).unwrap(), "second removal is a no-op");
        assert_counts_agree(&db, &h);

        assert!(db.remove_reference(b).unwrap());
        let file = db.find_file_by_hash(&h).unwrap().unwrap();
        assert_eq!(file.ref_count, 0);
        assert!(file.zero_since.is_some());
        assert!(db.get_reference(b).unwrap().deleted_at.is_some());
        assert_counts_agree(&db, &h);
    }

    #[test]
    fn unknown_hash_is_rejected() {
        let (mut db, _dir) = test_db();
        let err = db.add_reference(&hash(3), UserId(1), RefType::ChatFile, 1).unwrap_err();
        assert!(matches!(err, StoreError::UnknownAttachment(_)));
    }

    #[test]
    fn avatar_swap_releases_previous() {
        let (mut db, _dir) = test_db();
        let (old, new) = (hash(4), hash(5));
        db.insert_file(&new_file(&old)).unwrap();
        db.insert_file(&new_file(&new)).unwrap();

        db.set_avatar(UserId(7), &old).unwrap();
        db.set_avatar(UserId(7), &new).unwrap();

        assert_eq!(db.find_file_by_hash(&old).unwrap().unwrap().ref_count, 0);
        assert_eq!(db.find_file_by_hash(&new).unwrap().unwrap().ref_count, 1);
        assert_eq!(db.avatar_for(UserId(7)).unwrap().unwrap().hash, new);

        // Setting the same avatar again keeps exactly one live reference.
        db.set_avatar(UserId(7), &new).unwrap();
        assert_eq!(db.find_file_by_hash(&new).unwrap().unwrap().ref_count, 1);
        assert_counts_agree(&db, &new);
    }

    #[test]
    fn reclaim_respects_count_and_grace() {
        let (mut db, _dir) = test_db();
        let (held, orphan) = (hash(6), hash(7));
        db.insert_file(&new_file(&held)).unwrap();
        db.insert_file(&new_file(&orphan)).unwrap();
        db.add_reference(&held, UserId(1), RefType::ChatImage, 1).unwrap();

        // Nothing is old enough yet.
        let before = Utc::now() - Duration::hours(1);
        assert!(db.reclaim_candidates(&before, 100).unwrap().is_empty());

        let cutoff = Utc::now() + Duration::seconds(1);
        let candidates = db.reclaim_candidates(&cutoff, 100).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].hash, orphan);

        let held_id = db.find_file_by_hash(&held).unwrap().unwrap().id;
        let outcome = db.reclaim_file(held_id, &cutoff, |_| Ok(())).unwrap();
        assert_eq!(outcome, ReclaimOutcome::Skipped);

        let mut deleted = Vec::new();
        let outcome = db
            .reclaim_file(candidates[0].id, &cutoff, |path| {
                deleted.push(path.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, ReclaimOutcome::Reclaimed);
        assert_eq!(deleted, vec![format!("/blobs/{orphan}")]);
        assert!(db.find_file_by_hash(&orphan).unwrap().is_none());
        assert!(db.find_file_by_hash(&held).unwrap().is_some());
    }

    #[test]
    fn reclaim_keeps_row_when_delete_fails() {
        let (mut db, _dir) = test_db();
        let h = hash(8);
        let file = db.insert_file(&new_file(&h)).unwrap();
        let cutoff = Utc::now() + Duration::seconds(1);

        let err = db
            .reclaim_file(file.id, &cutoff, |_| {
                Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(db.find_file_by_hash(&h).unwrap().is_some());
    }

    #[test]
    fn reclaim_detects_count_drift() {
        let (mut db, _dir) = test_db();
        let h = hash(9);
        let file = db.insert_file(&new_file(&h)).unwrap();
        db.add_reference(&h, UserId(1), RefType::ChatImage, 1).unwrap();

        // Simulate drift that bypassed the reference API.
        db.conn()
            .execute(
                "UPDATE file_storage SET ref_count = 0, zero_since = ?1 WHERE id = ?2",
                params![format_ts(&(Utc::now() - Duration::days(1))), file.id],
            )
            .unwrap();

        let cutoff = Utc::now();
        let err = db.reclaim_file(file.id, &cutoff, |_| Ok(())).unwrap_err();
        assert!(matches!(err, StoreError::Integrity { live: 1, ref_count: 0, .. }));
        assert!(db.find_file_by_hash(&h).unwrap().is_some());
    }
}
