//! Shared access to the SQLite store from async code.
//!
//! rusqlite is blocking, so every call runs on tokio's blocking pool while
//! holding the connection mutex. SQLite allows one writer at a time anyway;
//! the store's `IMMEDIATE` transactions make that explicit.

use std::path::Path;
use std::sync::{Arc, Mutex};

use courier_store::{Database, StoreError};

use crate::error::ServerError;

#[derive(Clone)]
pub struct SharedDb {
    inner: Arc<Mutex<Database>>,
}

impl SharedDb {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub async fn open(path: &Path) -> Result<Self, ServerError> {
        let path = path.to_path_buf();
        let db = tokio::task::spawn_blocking(move || Database::open_at(&path))
            .await
            .map_err(|e| ServerError::Internal(format!("Database open task failed: {e}")))??;
        Ok(Self::new(db))
    }

    /// Run `f` against the database on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&mut Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut db = inner
                .lock()
                .map_err(|_| ServerError::Internal("Database lock poisoned".into()))?;
            f(&mut db).map_err(ServerError::from)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("Database task failed: {e}")))?
    }
}

#[cfg(test)]
pub(crate) async fn test_db() -> (SharedDb, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = SharedDb::open(&dir.path().join("test.db")).await.unwrap();
    (db, dir)
}
