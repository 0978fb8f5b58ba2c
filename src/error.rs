use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open {} for appending: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode record for {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to write record to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to close {}: {source}", path.display())]
    Close {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("writer for {} is already closed", path.display())]
    Closed { path: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink is shutting down and no longer accepts records")]
    Closed,

    #[error("{task} task failed: {source}")]
    Join {
        task: &'static str,
        source: tokio::task::JoinError,
    },
}
