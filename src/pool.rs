use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;

use crate::error::WriterError;
use crate::writer::Writer;

/// Open writers keyed by resolved path, at most one per path.
///
/// Mutation only ever happens from the queue worker. The map lock is held for
/// lookups and inserts only, file I/O runs under the per-writer lock, so the
/// garbage collector and the metrics endpoint never wait on the disk.
#[derive(Debug)]
pub struct WriterPool {
    writers: RwLock<HashMap<PathBuf, Arc<Mutex<Writer>>>>,
    ttl: Duration,
    opened: AtomicU64,
}

impl WriterPool {
    pub fn new(ttl: Duration) -> Self {
        Self {
            writers: RwLock::new(HashMap::new()),
            ttl,
            opened: AtomicU64::new(0),
        }
    }

    /// Return the writer for `path`, opening the file first if needed.
    ///
    /// The pool itself is unlocked again when this returns; the guard only
    /// pins the one writer.
    pub async fn get_or_create(
        &self,
        path: &Path,
    ) -> Result<OwnedMutexGuard<Writer>, WriterError> {
        let existing = self.writers.read().await.get(path).cloned();

        let writer = match existing {
            Some(writer) => writer,
            None => {
                // the worker is the only inserter, nobody can race us to this path
                let writer = Arc::new(Mutex::new(Writer::create(path, self.ttl).await?));
                self.writers
                    .write()
                    .await
                    .insert(path.to_path_buf(), writer.clone());
                self.opened.fetch_add(1, Ordering::Relaxed);
                writer
            }
        };

        Ok(writer.lock_owned().await)
    }

    /// Drop the entry for `path` and close its handle. Absent paths are ignored.
    pub async fn remove_and_close(&self, path: &Path) -> Result<bool, WriterError> {
        let removed = self.writers.write().await.remove(path);

        match removed {
            Some(writer) => {
                writer.lock().await.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Paths whose writer has expired at `now`. `None` matches every writer.
    ///
    /// A writer that is busy writing is in use and therefore never expired.
    pub async fn snapshot_expired(&self, now: Option<Instant>) -> Vec<PathBuf> {
        self.writers
            .read()
            .await
            .iter()
            .filter(|(_, writer)| match now {
                None => true,
                Some(_) => writer.try_lock().is_ok_and(|writer| writer.expired(now)),
            })
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.writers.read().await.len()
    }

    /// Writers opened since start, including ones closed since.
    pub fn opened_total(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) async fn stall(
        &self,
    ) -> tokio::sync::RwLockWriteGuard<'_, HashMap<PathBuf, Arc<Mutex<Writer>>>> {
        self.writers.write().await
    }
}
