use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid snapshot record {}: {reason}", .path.display())]
    InvalidRecord { path: PathBuf, reason: String },

    #[error("Data directory error: {0}")]
    DataDirUnavailable(String),

    #[error("Persistence queue is closed")]
    QueueClosed,
}

impl StorageError {
    pub fn data_dir_error(msg: impl Into<String>) -> Self {
        StorageError::DataDirUnavailable(msg.into())
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "Check file permissions and free disk space in the snapshot directory.",
            StorageError::Serialization(_) | StorageError::InvalidRecord { .. } => {
                "The snapshot file is damaged. Run 'livelink snapshots clear' to start fresh."
            }
            StorageError::DataDirUnavailable(_) => {
                "Set LIVELINK_DATA_DIR or snapshots.directory in the config file."
            }
            StorageError::QueueClosed => "The client is shutting down. Restart it to persist snapshots again.",
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
