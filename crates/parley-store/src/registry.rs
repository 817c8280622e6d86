use std::collections::HashMap;
use std::error::Error as StdError;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::{Stream, StreamExt};
use parley_shared::constants::MAX_FILE_NAME_CHARS;
use parley_shared::types::Identity;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{RegistryError, Result};
use crate::models::{FileAvailability, FileRecord, Snapshot, SNAPSHOT_VERSION};

/// In-memory cache of the snapshot.
#[derive(Default)]
struct Index {
    records: HashMap<Uuid, FileRecord>,
    last_created_at: Option<DateTime<Utc>>,
}

impl Index {
    fn from_records(records: Vec<FileRecord>) -> Self {
        let last_created_at = records.iter().map(|r| r.created_at).max();
        Self {
            records: records.into_iter().map(|r| (r.id, r)).collect(),
            last_created_at,
        }
    }

    /// Creation timestamps are strictly increasing so that "newest first" is
    /// a total order matching registration order.
    fn next_created_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_created_at {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        }
    }

    fn sorted_newest_first(&self) -> Vec<FileRecord> {
        let mut records: Vec<FileRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        records
    }
}

/// Durable mapping from file id to metadata.
///
/// Mutations are write-through: content is written first, then the full
/// snapshot is atomically rewritten, and only then is the in-memory index
/// updated. A failure at any step leaves the index exactly as it was.
pub struct FileRegistry {
    storage_dir: PathBuf,
    snapshot_path: PathBuf,
    max_file_size: usize,
    index: RwLock<Index>,
    /// Serializes registrations so each snapshot rewrite sees the previous one.
    mutation: Mutex<()>,
}

impl FileRegistry {
    /// Open the registry, creating the storage directory if missing and
    /// loading the snapshot into memory.
    pub async fn open(
        storage_dir: impl Into<PathBuf>,
        snapshot_path: impl Into<PathBuf>,
        max_file_size: usize,
    ) -> Result<Self> {
        let storage_dir = storage_dir.into();
        let snapshot_path = snapshot_path.into();

        fs::create_dir_all(&storage_dir).await?;
        if let Some(parent) = snapshot_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let records = load_snapshot(&snapshot_path, &storage_dir).await;
        info!(
            storage = %storage_dir.display(),
            snapshot = %snapshot_path.display(),
            files = records.len(),
            "File registry opened"
        );

        Ok(Self {
            storage_dir,
            snapshot_path,
            max_file_size,
            index: RwLock::new(Index::from_records(records)),
            mutation: Mutex::new(()),
        })
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    /// Store `content` under a fresh id and record it.
    ///
    /// `original_name` is sanitized and kept as display metadata only; the
    /// on-disk name is derived from the id.
    pub async fn register<S, E>(
        &self,
        uploader: &Identity,
        original_name: &str,
        content: S,
    ) -> Result<FileRecord>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let id = Uuid::new_v4();
        let storage_path = self.content_path(&id);
        let part_path = self.storage_dir.join(format!("{id}.part"));

        let size = match self.write_content(&part_path, content).await {
            Ok(size) => size,
            Err(e) => {
                discard(&part_path).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&part_path, &storage_path).await {
            discard(&part_path).await;
            return Err(e.into());
        }
        if let Err(e) = sync_dir(&self.storage_dir).await {
            discard(&storage_path).await;
            return Err(e.into());
        }

        let _guard = self.mutation.lock().await;

        let (record, files) = {
            let index = self.index.read().await;
            let record = FileRecord {
                id,
                original_name: sanitize_file_name(original_name),
                storage_path: storage_path.clone(),
                uploader: uploader.clone(),
                size_bytes: size,
                created_at: index.next_created_at(Utc::now()),
            };
            let mut files = index.sorted_newest_first();
            files.reverse();
            files.push(record.clone());
            (record, files)
        };

        if let Err(e) = write_snapshot(&self.snapshot_path, files).await {
            error!(id = %id, error = %e, "Failed to persist registry snapshot");
            discard(&storage_path).await;
            return Err(e);
        }

        {
            let mut index = self.index.write().await;
            index.last_created_at = Some(record.created_at);
            index.records.insert(id, record.clone());
        }

        info!(
            id = %id,
            uploader = %uploader,
            name = %record.original_name,
            size,
            "File registered"
        );
        Ok(record)
    }

    pub async fn lookup(&self, id: &Uuid) -> Result<FileRecord> {
        self.index
            .read()
            .await
            .records
            .get(id)
            .cloned()
            .ok_or(RegistryError::NotFound(*id))
    }

    /// Reconcile metadata against storage: `NotFound` for an unknown id,
    /// `Missing` for a known id whose content was removed out of band.
    pub async fn exists_on_disk(&self, id: &Uuid) -> Result<FileRecord> {
        let record = self.lookup(id).await?;
        if fs::try_exists(&record.storage_path).await? {
            Ok(record)
        } else {
            warn!(id = %id, path = %record.storage_path.display(), "Registered file missing on disk");
            Err(RegistryError::Missing(*id))
        }
    }

    pub async fn is_available(&self, id: &Uuid) -> bool {
        self.exists_on_disk(id).await.is_ok()
    }

    pub async fn availability(&self, id: &Uuid) -> FileAvailability {
        match self.exists_on_disk(id).await {
            Ok(record) => FileAvailability {
                exists: true,
                name: Some(record.original_name),
            },
            Err(_) => FileAvailability {
                exists: false,
                name: None,
            },
        }
    }

    /// Open registered content for streaming.
    pub async fn open_content(&self, id: &Uuid) -> Result<(FileRecord, fs::File)> {
        let record = self.lookup(id).await?;
        match fs::File::open(&record.storage_path).await {
            Ok(file) => Ok((record, file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RegistryError::Missing(*id)),
            Err(e) => Err(e.into()),
        }
    }

    /// All records, newest first.
    pub async fn list_all(&self) -> Vec<FileRecord> {
        self.index.read().await.sorted_newest_first()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn content_path(&self, id: &Uuid) -> PathBuf {
        self.storage_dir.join(id.to_string())
    }

    async fn write_content<S, E>(&self, path: &Path, content: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let mut content = std::pin::pin!(content);
        let mut file = fs::File::create(path).await?;
        let mut written: usize = 0;

        while let Some(chunk) = content.next().await {
            let chunk = chunk.map_err(|e| RegistryError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
            written += chunk.len();
            if written > self.max_file_size {
                return Err(RegistryError::TooLarge {
                    max: self.max_file_size,
                });
            }
            file.write_all(&chunk).await?;
        }

        if written == 0 {
            return Err(RegistryError::EmptyUpload);
        }

        file.flush().await?;
        file.sync_all().await?;
        debug!(path = %path.display(), size = written, "Content written");
        Ok(written as u64)
    }
}

/// Load the snapshot. Missing means empty; unreadable or corrupt degrades to
/// empty as well, after moving the bad file aside so it is not overwritten.
async fn load_snapshot(path: &Path, storage_dir: &Path) -> Vec<FileRecord> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No registry snapshot yet, starting empty");
            return Vec::new();
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read registry snapshot, starting empty");
            return Vec::new();
        }
    };

    let snapshot = match serde_json::from_slice::<Snapshot>(&bytes) {
        Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => snapshot,
        Ok(snapshot) => {
            error!(version = snapshot.version, "Unsupported registry snapshot version, starting empty");
            quarantine(path).await;
            return Vec::new();
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Corrupt registry snapshot, starting empty");
            quarantine(path).await;
            return Vec::new();
        }
    };

    snapshot
        .files
        .into_iter()
        .map(|mut record| {
            // Never trust a stored path: content always lives at <dir>/<id>.
            let expected = storage_dir.join(record.id.to_string());
            if record.storage_path != expected {
                warn!(
                    id = %record.id,
                    stored = %record.storage_path.display(),
                    "Snapshot path differs from storage layout, using derived path"
                );
                record.storage_path = expected;
            }
            record
        })
        .collect()
}

/// Atomically replace the snapshot: write a temp file, fsync, rename.
async fn write_snapshot(path: &Path, files: Vec<FileRecord>) -> Result<()> {
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        files,
    };
    let data = serde_json::to_vec_pretty(&snapshot)?;
    let tmp = tmp_path(path);

    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await?;
        Ok::<_, io::Error>(())
    }
    .await;

    if let Err(e) = result {
        discard(&tmp).await;
        return Err(e.into());
    }

    // The rename is the commit point; only its durability is in question now.
    if let Err(e) = sync_dir(parent_dir(path)).await {
        warn!(path = %path.display(), error = %e, "Failed to sync snapshot directory");
    }

    debug!(path = %path.display(), files = snapshot.files.len(), "Registry snapshot written");
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Directory holding `path`, `.` for a bare file name.
fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Persist directory entry changes (creates, renames) made inside `dir`.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

async fn quarantine(path: &Path) {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt-{}", Utc::now().timestamp()));
    let target = PathBuf::from(name);
    match fs::rename(path, &target).await {
        Ok(()) => warn!(moved_to = %target.display(), "Moved unreadable snapshot aside"),
        Err(e) => warn!(error = %e, "Could not move unreadable snapshot aside"),
    }
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to clean up file");
        }
    }
}

/// Reduce a client-supplied file name to something safe to display: last
/// path component only, no control characters, bounded length.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_FILE_NAME_CHARS)
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}
