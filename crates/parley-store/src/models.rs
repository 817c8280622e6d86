//! Registry records and their on-disk snapshot form.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parley_shared::types::Identity;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Metadata for one uploaded file. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    /// Random 128-bit identifier (UUID v4).
    pub id: Uuid,
    /// Sanitized client-supplied name, used for display only.
    pub original_name: String,
    /// Where the content lives; always `<storage dir>/<id>`.
    pub storage_path: PathBuf,
    pub uploader: Identity,
    #[serde(default)]
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// The whole registry as written to disk.
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Records in registration order.
    pub files: Vec<FileRecord>,
}

/// Answer to "does this file still exist?" for a client's message history.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileAvailability {
    pub exists: bool,
    pub name: Option<String>,
}
