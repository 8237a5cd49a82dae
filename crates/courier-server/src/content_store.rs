//! Content-addressed attachment storage with reference-counted reclamation.
//!
//! Bytes live in the [`BlobStore`]; the metadata rows and reference counts
//! live in SQLite. `put` and `reclaim` for the same hash are serialized by a
//! striped lock so a blob is written once and never deleted underneath a
//! concurrent upload of the same content. Reference counting itself relies
//! on the store's write transactions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use courier_shared::{RefType, UserId};
use courier_store::{FileStorage, NewFile, ReclaimOutcome, StoreError};

use crate::blob_store::BlobStore;
use crate::db::SharedDb;
use crate::error::ServerError;

/// Number of per-hash lock stripes.
const LOCK_STRIPES: usize = 64;

/// Upper bound on files examined per reclaim run.
const RECLAIM_BATCH: u32 = 500;

const DEFAULT_MIME: &str = "application/octet-stream";

/// Outcome of [`ContentStore::put`].
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file: FileStorage,
    /// `true` when the bytes were already stored and nothing was written.
    pub deduplicated: bool,
}

/// Summary of one reclaim run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub reclaimed: usize,
    pub reclaimed_bytes: i64,
    pub skipped: usize,
    pub integrity_errors: usize,
    pub failed: usize,
}

pub struct ContentStore {
    db: SharedDb,
    blobs: BlobStore,
    stripes: Vec<Mutex<()>>,
}

impl ContentStore {
    pub fn new(db: SharedDb, blobs: BlobStore) -> Self {
        Self {
            db,
            blobs,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    fn stripe(&self, hash: &str) -> &Mutex<()> {
        let prefix = hash.get(..2).and_then(|p| u8::from_str_radix(p, 16).ok()).unwrap_or(0);
        &self.stripes[prefix as usize % LOCK_STRIPES]
    }

    /// Store `data` under its content hash.
    ///
    /// Identical content is stored once: a second `put` finds the existing
    /// row and returns it without touching the bytes (unless the file has
    /// gone missing from disk, in which case it is rewritten). The reference
    /// count is not changed here; see [`add_reference`](Self::add_reference).
    /// An unreferenced file gets a fresh grace period so the caller has time
    /// to reference it before the next reclaim.
    pub async fn put(
        &self,
        data: &[u8],
        file_name: &str,
        mime_type: &str,
    ) -> Result<StoredFile, ServerError> {
        self.blobs.check_size(data.len())?;
        let hash = blake3::hash(data).to_hex().to_string();

        let _guard = self.stripe(&hash).lock().await;

        let lookup = hash.clone();
        let existing = self
            .db
            .call(move |db| db.find_file_by_hash(&lookup))
            .await?;

        if let Some(file) = existing {
            let path = PathBuf::from(&file.storage_path);
            if !self.blobs.exists(&path).await {
                warn!(hash = %hash, "Stored blob missing on disk, rewriting");
                self.blobs.write_blob(&hash, data).await?;
            }
            let file = if file.ref_count == 0 {
                let file_id = file.id;
                self.db
                    .call(move |db| db.refresh_unreferenced(file_id))
                    .await?
            } else {
                file
            };
            debug!(hash = %hash, refs = file.ref_count, "Upload deduplicated");
            return Ok(StoredFile {
                file,
                deduplicated: true,
            });
        }

        let path = self.blobs.write_blob(&hash, data).await?;
        let new_file = NewFile {
            hash: hash.clone(),
            file_name: clean_file_name(file_name),
            file_size: data.len() as i64,
            mime_type: if mime_type.trim().is_empty() {
                DEFAULT_MIME.to_string()
            } else {
                mime_type.trim().to_string()
            },
            storage_path: path.to_string_lossy().into_owned(),
        };

        match self.db.call(move |db| db.insert_file(&new_file)).await {
            Ok(file) => {
                info!(hash = %hash, size = data.len(), "Stored new file");
                Ok(StoredFile {
                    file,
                    deduplicated: false,
                })
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(e)
            }
        }
    }

    /// Record one logical use of a stored file.
    pub async fn add_reference(
        &self,
        hash: &str,
        user: UserId,
        ref_type: RefType,
        ref_id: i64,
    ) -> Result<i64, ServerError> {
        let hash = hash.to_string();
        self.db
            .call(move |db| db.add_reference(&hash, user, ref_type, ref_id))
            .await
    }

    /// Release one logical use. The bytes are left for [`reclaim`](Self::reclaim).
    pub async fn remove_reference(&self, reference_id: i64) -> Result<bool, ServerError> {
        self.db
            .call(move |db| db.remove_reference(reference_id))
            .await
    }

    pub async fn set_avatar(&self, user: UserId, hash: &str) -> Result<i64, ServerError> {
        let hash = hash.to_string();
        self.db.call(move |db| db.set_avatar(user, &hash)).await
    }

    /// Metadata and bytes for `hash`.
    pub async fn open(&self, hash: &str) -> Result<(FileStorage, Vec<u8>), ServerError> {
        courier_shared::types::validate_content_hash(hash)?;
        let lookup = hash.to_string();
        let file = self
            .db
            .call(move |db| db.find_file_by_hash(&lookup))
            .await?
            .ok_or_else(|| ServerError::BlobNotFound(hash.to_string()))?;
        let data = self
            .blobs
            .read_blob(hash, Path::new(&file.storage_path))
            .await?;
        Ok((file, data))
    }

    /// Delete files that have had no references for longer than `grace`.
    ///
    /// Each file is handled independently: an integrity mismatch or I/O
    /// failure on one is logged and the sweep moves on.
    pub async fn reclaim(&self, grace: Duration) -> Result<ReclaimReport, ServerError> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| ServerError::Internal(format!("Invalid grace period: {e}")))?;
        let cutoff = Utc::now() - grace;

        let candidates = self
            .db
            .call(move |db| db.reclaim_candidates(&cutoff, RECLAIM_BATCH))
            .await?;

        let mut report = ReclaimReport::default();
        for candidate in candidates {
            let _guard = self.stripe(&candidate.hash).lock().await;

            let blobs = self.blobs.clone();
            let file_id = candidate.id;
            let result = self
                .db
                .call(move |db| {
                    db.reclaim_file(file_id, &cutoff, |path| {
                        blobs.delete_blob_blocking(Path::new(path))
                    })
                })
                .await;

            match result {
                Ok(ReclaimOutcome::Reclaimed) => {
                    report.reclaimed += 1;
                    report.reclaimed_bytes += candidate.file_size;
                }
                Ok(ReclaimOutcome::Skipped) => report.skipped += 1,
                Err(ServerError::Persistence(StoreError::Integrity {
                    hash,
                    ref_count,
                    live,
                })) => {
                    error!(
                        hash = %hash,
                        ref_count,
                        live,
                        "Reference count mismatch, skipping reclaim"
                    );
                    report.integrity_errors += 1;
                }
                Err(e) => {
                    warn!(hash = %candidate.hash, error = %e, "Failed to reclaim file");
                    report.failed += 1;
                }
            }
        }

        if report != ReclaimReport::default() {
            info!(
                reclaimed = report.reclaimed,
                bytes = report.reclaimed_bytes,
                skipped = report.skipped,
                integrity_errors = report.integrity_errors,
                failed = report.failed,
                "Reclaim run finished"
            );
        }
        Ok(report)
    }
}

/// Keep only the final path component of a client-supplied name.
fn clean_file_name(name: &str) -> String {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        "file".to_string()
    } else {
        base.to_string()
    }
}

#[cfg(test)]
pub(crate) async fn test_content_store() -> (std::sync::Arc<ContentStore>, SharedDb, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = SharedDb::open(&dir.path().join("test.db")).await.unwrap();
    let blobs = BlobStore::new(dir.path().join("blobs"), 1024 * 1024)
        .await
        .unwrap();
    (std::sync::Arc::new(ContentStore::new(db.clone(), blobs)), db, dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn live_count(db: &SharedDb, hash: &str) -> usize {
        let hash = hash.to_string();
        db.call(move |db| db.live_references(&hash)).await.unwrap().len()
    }

    async fn ref_count(db: &SharedDb, hash: &str) -> i64 {
        let hash = hash.to_string();
        db.call(move |db| db.find_file_by_hash(&hash))
            .await
            .unwrap()
            .unwrap()
            .ref_count
    }

    fn files_on_disk(root: &Path) -> usize {
        let mut count = 0;
        for shard in std::fs::read_dir(root).unwrap() {
            let shard = shard.unwrap().path();
            if shard.is_dir() {
                count += std::fs::read_dir(&shard).unwrap().count();
            }
        }
        count
    }

    #[tokio::test]
    async fn identical_uploads_share_one_blob() {
        let (store, db, _dir) = test_content_store().await;

        let first = store.put(b"same bytes", "a.png", "image/png").await.unwrap();
        let second = store.put(b"same bytes", "b.png", "image/png").await.unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.file.id, second.file.id);
        assert_eq!(first.file.file_name, "a.png");
        assert_eq!(files_on_disk(store.blobs().base_path()), 1);

        for ref_id in [1, 2] {
            store
                .add_reference(&first.file.hash, UserId(1), RefType::ChatImage, ref_id)
                .await
                .unwrap();
        }
        assert_eq!(ref_count(&db, &first.file.hash).await, 2);
        assert_eq!(live_count(&db, &first.file.hash).await, 2);
    }

    #[tokio::test]
    async fn concurrent_puts_write_once() {
        let (store, _db, _dir) = test_content_store().await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.put(b"racing upload", "r.bin", "").await.unwrap()
            }));
        }
        let mut fresh = 0;
        for task in tasks {
            if !task.await.unwrap().deduplicated {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(files_on_disk(store.blobs().base_path()), 1);
    }

    #[tokio::test]
    async fn concurrent_reference_churn_keeps_counts_equal() {
        let (store, db, _dir) = test_content_store().await;
        let hash = store.put(b"shared", "s.txt", "text/plain").await.unwrap().file.hash;

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let hash = hash.clone();
            tasks.push(tokio::spawn(async move {
                let id = store
                    .add_reference(&hash, UserId(i), RefType::ChatFile, i)
                    .await
                    .unwrap();
                if i % 2 == 0 {
                    assert!(store.remove_reference(id).await.unwrap());
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(ref_count(&db, &hash).await, 10);
        assert_eq!(live_count(&db, &hash).await, 10);
    }

    #[tokio::test]
    async fn reclaim_waits_for_grace_and_zero_refs() {
        let (store, db, _dir) = test_content_store().await;
        let held = store.put(b"held", "h", "").await.unwrap().file;
        let dropped = store.put(b"dropped", "d", "").await.unwrap().file;

        store.add_reference(&held.hash, UserId(1), RefType::ChatImage, 1).await.unwrap();
        let r = store
            .add_reference(&dropped.hash, UserId(1), RefType::ChatImage, 2)
            .await
            .unwrap();
        store.remove_reference(r).await.unwrap();

        // Inside the grace window nothing goes.
        let report = store.reclaim(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(report.reclaimed, 0);

        let report = store.reclaim(Duration::ZERO).await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.reclaimed_bytes, dropped.file_size);

        assert!(!Path::new(&dropped.storage_path).exists());
        assert!(Path::new(&held.storage_path).exists());
        let dropped_hash = dropped.hash.clone();
        assert!(db
            .call(move |db| db.find_file_by_hash(&dropped_hash))
            .await
            .unwrap()
            .is_none());
        assert_eq!(ref_count(&db, &held.hash).await, 1);
    }

    #[tokio::test]
    async fn repeated_upload_restarts_grace() {
        let (store, db, _dir) = test_content_store().await;
        let first = store.put(b"same bytes", "a", "").await.unwrap();
        assert!(!first.deduplicated);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let again = store.put(b"same bytes", "a", "").await.unwrap();
        assert!(again.deduplicated);
        assert!(again.file.zero_since > first.file.zero_since);

        // Old enough by the first upload, fresh by the second.
        let report = store.reclaim(Duration::from_millis(100)).await.unwrap();
        assert_eq!(report.reclaimed, 0);
        assert!(store.open(&again.file.hash).await.is_ok());

        store
            .add_reference(&again.file.hash, UserId(3), RefType::ChatFile, 1)
            .await
            .unwrap();
        assert_eq!(ref_count(&db, &again.file.hash).await, 1);
    }

    #[tokio::test]
    async fn reupload_after_reclaim_restores_bytes() {
        let (store, _db, _dir) = test_content_store().await;
        let first = store.put(b"phoenix", "p", "").await.unwrap();
        store.reclaim(Duration::ZERO).await.unwrap();

        let again = store.put(b"phoenix", "p", "").await.unwrap();
        assert!(!again.deduplicated);
        let (_, bytes) = store.open(&again.file.hash).await.unwrap();
        assert_eq!(bytes, b"phoenix");
        assert_eq!(first.file.hash, again.file.hash);
    }

    #[tokio::test]
    async fn missing_bytes_are_rewritten_on_put() {
        let (store, _db, _dir) = test_content_store().await;
        let stored = store.put(b"fragile", "f", "").await.unwrap();
        std::fs::remove_file(&stored.file.storage_path).unwrap();

        let again = store.put(b"fragile", "f", "").await.unwrap();
        assert!(again.deduplicated);
        let (_, bytes) = store.open(&stored.file.hash).await.unwrap();
        assert_eq!(bytes, b"fragile");
    }

    #[tokio::test]
    async fn integrity_mismatch_skips_only_that_file() {
        let (store, db, _dir) = test_content_store().await;
        let broken = store.put(b"broken", "b", "").await.unwrap().file;
        let orphan = store.put(b"orphan", "o", "").await.unwrap().file;
        store
            .add_reference(&broken.hash, UserId(1), RefType::ChatImage, 1)
            .await
            .unwrap();

        let broken_id = broken.id;
        db.call(move |db| {
            db.conn()
                .execute(
                    "UPDATE file_storage SET ref_count = 0, zero_since = created_at WHERE id = ?1",
                    [broken_id],
                )
                .map_err(StoreError::from)
        })
        .await
        .unwrap();

        let report = store.reclaim(Duration::ZERO).await.unwrap();
        assert_eq!(report.integrity_errors, 1);
        assert_eq!(report.reclaimed, 1);
        assert!(Path::new(&broken.storage_path).exists());
        assert!(!Path::new(&orphan.storage_path).exists());
    }

    #[tokio::test]
    async fn avatar_swap_through_store() {
        let (store, db, _dir) = test_content_store().await;
        let a = store.put(b"avatar-a", "a.png", "image/png").await.unwrap().file;
        let b = store.put(b"avatar-b", "b.png", "image/png").await.unwrap().file;

        store.set_avatar(UserId(3), &a.hash).await.unwrap();
        store.set_avatar(UserId(3), &b.hash).await.unwrap();

        assert_eq!(ref_count(&db, &a.hash).await, 0);
        assert_eq!(ref_count(&db, &b.hash).await, 1);

        let report = store.reclaim(Duration::ZERO).await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert!(store.open(&a.hash).await.is_err());
    }

    #[test]
    fn file_names_are_flattened() {
        assert_eq!(clean_file_name("../../etc/passwd"), "passwd");
        assert_eq!(clean_file_name("C:\\pics\\cat.jpg"), "cat.jpg");
        assert_eq!(clean_file_name("  "), "file");
        assert_eq!(clean_file_name(".."), "file");
    }
}
