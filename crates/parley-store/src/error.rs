use std::io;

use thiserror::Error;
use uuid::Uuid;

/// `ENOSPC` on Linux and macOS.
const ENOSPC: i32 = 28;

/// Errors produced by the file registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No record with this id.
    #[error("File not found: {0}")]
    NotFound(Uuid),

    /// The record exists but its content is gone from storage.
    #[error("File content missing from storage: {0}")]
    Missing(Uuid),

    #[error("Storage is full")]
    StorageFull,

    #[error("File too large (max {max} bytes)")]
    TooLarge { max: usize },

    #[error("Empty upload")]
    EmptyUpload,

    /// Generic I/O error while writing or reading content or the snapshot.
    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("Snapshot serialization error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl From<io::Error> for RegistryError {
    fn from(e: io::Error) -> Self {
        if e.raw_os_error() == Some(ENOSPC) {
            RegistryError::StorageFull
        } else {
            RegistryError::Io(e)
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RegistryError>;
