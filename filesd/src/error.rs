use std::{path::PathBuf, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("entry store: {0}")]
    Store(#[from] sled::Error),
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode target groups: {0}")]
    Encode(#[from] serde_json::Error),
    /// A persisted record that cannot be turned back into a registry entry.
    #[error("corrupt record {key:?}: {reason}")]
    CorruptRecord { key: String, reason: String },
    #[error("failed to spawn registry worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("registry worker is not running")]
    WorkerGone,
    #[error("no answer from the registry within {0:?}")]
    Timeout(Duration),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
