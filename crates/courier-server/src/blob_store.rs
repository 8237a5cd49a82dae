//! On-disk bytes for the content store.
//!
//! Blobs are named by their content hash and sharded into sub-directories by
//! the first two hex characters: `<base>/ab/abcdef...`. Writes go to a
//! temporary file first and are renamed into place, so a reader never sees a
//! partially written blob.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use courier_shared::types::validate_content_hash;

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
/// Prevents path traversal attacks.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let mut resolved = base.to_path_buf();
    for component in target.strip_prefix(base).unwrap_or(target).components() {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(ServerError::BadRequest(
                    "Path traversal detected".to_string(),
                ));
            }
            _ => {} // RootDir, CurDir, Prefix: skip
        }
    }
    if !resolved.starts_with(base) {
        return Err(ServerError::BadRequest(
            "Path traversal detected".to_string(),
        ));
    }
    Ok(resolved)
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl BlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::BlobStorage(format!(
                "Failed to create blob directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        // Resolve once so that stored paths are absolute and stable.
        let base_path = base_path.canonicalize().unwrap_or(base_path);

        info!(path = %base_path.display(), "Blob store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn check_size(&self, size: usize) -> Result<(), ServerError> {
        if size == 0 {
            return Err(ServerError::BadRequest("Empty blob".to_string()));
        }
        if size > self.max_size {
            return Err(ServerError::BlobTooLarge {
                size,
                max: self.max_size,
            });
        }
        Ok(())
    }

    /// Where the blob with `hash` lives (whether or not it exists yet).
    pub fn path_for(&self, hash: &str) -> Result<PathBuf, ServerError> {
        validate_content_hash(hash)?;
        let raw = self.base_path.join(&hash[..2]).join(hash);
        ensure_within(&self.base_path, &raw)
    }

    /// Write `data` under its hash, replacing any existing file atomically.
    pub async fn write_blob(&self, hash: &str, data: &[u8]) -> Result<PathBuf, ServerError> {
        self.check_size(data.len())?;
        let path = self.path_for(hash)?;

        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard).await.map_err(|e| {
                ServerError::BlobStorage(format!("Failed to create shard for {}: {}", hash, e))
            })?;
        }

        let tmp = path.with_file_name(format!(".{}.{}.tmp", hash, Uuid::new_v4()));
        fs::write(&tmp, data)
            .await
            .map_err(|e| ServerError::BlobStorage(format!("Failed to write blob {}: {}", hash, e)))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(ServerError::BlobStorage(format!(
                "Failed to move blob {} into place: {}",
                hash, e
            )));
        }

        debug!(hash, size = data.len(), "Stored blob");
        Ok(path)
    }

    pub async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn read_blob(&self, hash: &str, path: &Path) -> Result<Vec<u8>, ServerError> {
        let path = ensure_within(&self.base_path, path)?;
        match fs::read(&path).await {
            Ok(data) => {
                debug!(hash, size = data.len(), "Retrieved blob");
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::BlobNotFound(hash.to_string()))
            }
            Err(e) => Err(ServerError::BlobStorage(format!(
                "Failed to read blob {}: {}",
                hash, e
            ))),
        }
    }

    /// Remove a blob file. Blocking: called from inside a store transaction
    /// on the blocking pool.
    pub fn delete_blob_blocking(&self, path: &Path) -> std::io::Result<()> {
        let path = ensure_within(&self.base_path, path).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
        })?;
        std::fs::remove_file(&path)?;
        debug!(path = %path.display(), "Deleted blob");
        Ok(())
    }
}
