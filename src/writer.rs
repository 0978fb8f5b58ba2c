use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::debug;

use crate::error::WriterError;
use crate::types::Record;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// How a writer's expiry reacts to activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryPolicy {
    /// Every successful write pushes the expiry out by one TTL.
    #[default]
    Sliding,
    /// Expiry is fixed when the file is opened, busy files are reopened every TTL.
    Fixed,
}

/// Append-only handle for one destination file.
#[derive(Debug)]
pub struct Writer {
    path: PathBuf,
    file: Option<File>,
    ttl: Duration,
    expires: Instant,
}

impl Writer {
    /// Create missing parent directories and open `path` for appending.
    pub async fn create(path: &Path, ttl: Duration) -> Result<Self, WriterError> {
        if let Some(directory) = path.parent()
            && !directory.as_os_str().is_empty()
        {
            fs::create_dir_all(directory)
                .await
                .map_err(|source| WriterError::CreateDir {
                    path: directory.to_path_buf(),
                    source,
                })?;
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);

        let file = options
            .open(path)
            .await
            .map_err(|source| WriterError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        debug!("Opened writer for {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            ttl,
            expires: Instant::now() + ttl,
        })
    }

    pub fn expires_at(&self) -> Instant {
        self.expires
    }

    /// Append the record as a single JSON line.
    pub async fn write(&mut self, record: &Record) -> Result<(), WriterError> {
        let Some(file) = self.file.as_mut() else {
            return Err(WriterError::Closed {
                path: self.path.clone(),
            });
        };

        let mut line = serde_json::to_vec(record).map_err(|source| WriterError::Encode {
            path: self.path.clone(),
            source,
        })?;
        line.push(b'\n');

        file.write_all(&line)
            .await
            .map_err(|source| WriterError::Write {
                path: self.path.clone(),
                source,
            })?;
        file.flush().await.map_err(|source| WriterError::Write {
            path: self.path.clone(),
            source,
        })?;

        Ok(())
    }

    /// Release the file handle. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), WriterError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };

        file.flush().await.map_err(|source| WriterError::Close {
            path: self.path.clone(),
            source,
        })?;
        // waits for in-flight operations, dropping the std handle closes it
        drop(file.into_std().await);

        debug!("Closed writer for {}", self.path.display());
        Ok(())
    }

    /// `None` stands for "no clock", which expires everything.
    pub fn expired(&self, now: Option<Instant>) -> bool {
        now.is_none_or(|now| now > self.expires_at())
    }

    pub fn touch(&mut self) {
        self.expires = Instant::now() + self.ttl;
    }
}
