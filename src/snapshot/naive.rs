//! Directory-copy snapshotter.
//!
//! Each snapshot is a plain directory under `<root>/snapshots/<id>`. A new
//! snapshot starts as a full copy of its parent, so no overlay support or
//! privileges are needed, at the cost of disk space and copy time.
//!
//! Metadata for all snapshots lives in `<root>/metadata.json`. Every
//! mutation is applied to a copy of the metadata, persisted atomically, and
//! only then made visible; a failed write leaves the previous state intact.

use super::{Info, Kind, Mount, Snapshotter, Usage};
use crate::constants::{DEFAULT_ROOT_DIR, SNAPSHOT_DIR, SNAPSHOT_METADATA_FILE, validate_key};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Persisted record of one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    id: String,
    kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
    #[serde(default)]
    labels: HashMap<String, String>,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
}

impl Record {
    fn info(&self, name: &str) -> Info {
        Info {
            name: name.to_string(),
            parent: self.parent.clone(),
            kind: self.kind,
            labels: self.labels.clone(),
            created: self.created,
            updated: self.updated,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Metadata {
    #[serde(default)]
    snapshots: BTreeMap<String, Record>,
}

/// In-memory state guarded by the snapshotter mutex.
#[derive(Debug, Default)]
struct State {
    metadata: Metadata,
    /// Keys whose directory is still being populated, mapped to their parent.
    pending: HashMap<String, Option<String>>,
}

impl State {
    fn is_taken(&self, key: &str) -> bool {
        self.metadata.snapshots.contains_key(key) || self.pending.contains_key(key)
    }

    fn child_of(&self, key: &str) -> Option<&str> {
        self.metadata
            .snapshots
            .iter()
            .find(|(_, r)| r.parent.as_deref() == Some(key))
            .map(|(name, _)| name.as_str())
            .or_else(|| {
                self.pending
                    .iter()
                    .find(|(_, p)| p.as_deref() == Some(key))
                    .map(|(name, _)| name.as_str())
            })
    }
}

/// Snapshotter backed by full directory copies.
///
/// ## Thread Safety
///
/// Metadata sits behind a mutex that is only held for bookkeeping. Parent
/// copies and usage walks run on the blocking pool with the lock released.
/// A key is reserved before its copy starts, so two concurrent prepares of
/// the same key cannot both succeed and a parent cannot be removed while a
/// child is being copied from it.
pub struct NaiveSnapshotter {
    root: PathBuf,
    state: Mutex<State>,
}

impl NaiveSnapshotter {
    /// Opens a snapshotter at the default location.
    pub fn new() -> Result<Self> {
        Self::with_path(
            dirs::home_dir()
                .unwrap_or_default()
                .join(DEFAULT_ROOT_DIR)
                .join(SNAPSHOT_DIR),
        )
    }

    /// Opens (or creates) a snapshotter rooted at `root`.
    pub fn with_path(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join(SNAPSHOT_DIR)).map_err(|e| Error::StorageInitFailed {
            path: root.clone(),
            reason: e.to_string(),
        })?;

        let metadata_path = root.join(SNAPSHOT_METADATA_FILE);
        let metadata = if metadata_path.exists() {
            let raw = fs::read(&metadata_path)?;
            serde_json::from_slice(&raw)?
        } else {
            Metadata::default()
        };

        info!(
            "Snapshotter initialized at: {} ({} snapshots)",
            root.display(),
            metadata.snapshots.len()
        );

        Ok(Self {
            root,
            state: Mutex::new(State {
                metadata,
                pending: HashMap::new(),
            }),
        })
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.root.join(SNAPSHOT_DIR).join(id)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Persists `next` and installs it as the current metadata.
    fn store(&self, current: &mut Metadata, next: Metadata) -> Result<()> {
        let path = self.root.join(SNAPSHOT_METADATA_FILE);
        let temp = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp, serde_json::to_vec_pretty(&next)?)?;
        if let Err(e) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        *current = next;
        Ok(())
    }

    fn mounts_for(&self, record: &Record) -> Vec<Mount> {
        vec![Mount::bind(
            &self.snapshot_dir(&record.id),
            record.kind == Kind::View,
        )]
    }

    async fn create_snapshot(
        &self,
        kind: Kind,
        key: &str,
        parent: Option<&str>,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        validate_key(key)?;
        let parent = parent.filter(|p| !p.is_empty());

        let parent_dir = {
            let mut state = self.lock()?;
            if state.is_taken(key) {
                return Err(Error::SnapshotAlreadyExists(key.to_string()));
            }
            let parent_dir = match parent {
                None => None,
                Some(p) => {
                    let record = state
                        .metadata
                        .snapshots
                        .get(p)
                        .ok_or_else(|| Error::SnapshotNotFound(p.to_string()))?;
                    if record.kind != Kind::Committed {
                        return Err(Error::FailedPrecondition(format!(
                            "parent {} is {}, not committed",
                            p, record.kind
                        )));
                    }
                    Some(self.snapshot_dir(&record.id))
                }
            };
            state
                .pending
                .insert(key.to_string(), parent.map(str::to_string));
            parent_dir
        };

        let id = uuid::Uuid::now_v7().to_string();
        let dir = self.snapshot_dir(&id);
        let populated = {
            let dir = dir.clone();
            blocking(move || {
                fs::create_dir_all(&dir)?;
                if let Some(src) = &parent_dir
                    && let Err(e) = copy_dir(src, &dir)
                {
                    let _ = fs::remove_dir_all(&dir);
                    return Err(e);
                }
                Ok(())
            })
            .await
        };

        let mut state = self.lock()?;
        state.pending.remove(key);
        populated?;

        let now = Utc::now();
        let record = Record {
            id,
            kind,
            parent: parent.map(str::to_string),
            labels,
            created: now,
            updated: now,
            usage: None,
        };
        let mounts = self.mounts_for(&record);

        let mut next = state.metadata.clone();
        next.snapshots.insert(key.to_string(), record);
        if let Err(e) = self.store(&mut state.metadata, next) {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }

        debug!(key, ?parent, %kind, "created snapshot");
        Ok(mounts)
    }
}

#[async_trait]
impl Snapshotter for NaiveSnapshotter {
    fn name(&self) -> &str {
        "naive"
    }

    async fn stat(&self, key: &str) -> Result<Info> {
        let state = self.lock()?;
        state
            .metadata
            .snapshots
            .get(key)
            .map(|r| r.info(key))
            .ok_or_else(|| Error::SnapshotNotFound(key.to_string()))
    }

    async fn update_labels(&self, key: &str, labels: HashMap<String, String>) -> Result<Info> {
        let mut state = self.lock()?;
        let mut next = state.metadata.clone();
        let record = next
            .snapshots
            .get_mut(key)
            .ok_or_else(|| Error::SnapshotNotFound(key.to_string()))?;
        for (k, v) in labels {
            if v.is_empty() {
                record.labels.remove(&k);
            } else {
                record.labels.insert(k, v);
            }
        }
        record.updated = Utc::now();
        let info = record.info(key);
        self.store(&mut state.metadata, next)?;
        Ok(info)
    }

    async fn usage(&self, key: &str) -> Result<Usage> {
        let dir = {
            let state = self.lock()?;
            let record = state
                .metadata
                .snapshots
                .get(key)
                .ok_or_else(|| Error::SnapshotNotFound(key.to_string()))?;
            match record.usage {
                Some(usage) if record.kind == Kind::Committed => return Ok(usage),
                _ => self.snapshot_dir(&record.id),
            }
        };
        blocking(move || dir_usage(&dir)).await
    }

    async fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let state = self.lock()?;
        let record = state
            .metadata
            .snapshots
            .get(key)
            .ok_or_else(|| Error::SnapshotNotFound(key.to_string()))?;
        if record.kind == Kind::Committed {
            return Err(Error::FailedPrecondition(format!(
                "snapshot {} is committed and has no mounts",
                key
            )));
        }
        Ok(self.mounts_for(record))
    }

    async fn prepare(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        self.create_snapshot(Kind::Active, key, parent, labels).await
    }

    async fn view(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        self.create_snapshot(Kind::View, key, parent, labels).await
    }

    async fn commit(&self, name: &str, key: &str, labels: HashMap<String, String>) -> Result<()> {
        validate_key(name)?;

        let (id, dir) = {
            let state = self.lock()?;
            let record = active_record(&state, name, key)?;
            (record.id.clone(), self.snapshot_dir(&record.id))
        };

        let usage = blocking(move || dir_usage(&dir)).await?;

        // The lock was released for the walk; recheck before renaming.
        let mut state = self.lock()?;
        if active_record(&state, name, key)?.id != id {
            return Err(Error::SnapshotNotFound(key.to_string()));
        }

        let mut next = state.metadata.clone();
        let Some(mut record) = next.snapshots.remove(key) else {
            return Err(Error::SnapshotNotFound(key.to_string()));
        };
        record.kind = Kind::Committed;
        record.usage = Some(usage);
        record.labels.extend(labels);
        record.updated = Utc::now();
        next.snapshots.insert(name.to_string(), record);
        self.store(&mut state.metadata, next)?;

        debug!(name, key, size = usage.size, "committed snapshot");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut state = self.lock()?;
        let Some(record) = state.metadata.snapshots.get(key) else {
            return Err(Error::SnapshotNotFound(key.to_string()));
        };
        if let Some(child) = state.child_of(key) {
            return Err(Error::FailedPrecondition(format!(
                "cannot remove snapshot {} with child {}",
                key, child
            )));
        }

        let dir = self.snapshot_dir(&record.id);
        let mut next = state.metadata.clone();
        next.snapshots.remove(key);
        self.store(&mut state.metadata, next)?;
        drop(state);

        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!("Failed to remove snapshot directory {}: {}", dir.display(), e);
        }
        debug!(key, "removed snapshot");
        Ok(())
    }

    async fn walk(&self) -> Result<Vec<Info>> {
        let state = self.lock()?;
        Ok(state
            .metadata
            .snapshots
            .iter()
            .map(|(name, r)| r.info(name))
            .collect())
    }
}

/// Looks up `key` as an active snapshot that can be committed as `name`.
fn active_record<'a>(state: &'a State, name: &str, key: &str) -> Result<&'a Record> {
    let record = state
        .metadata
        .snapshots
        .get(key)
        .ok_or_else(|| Error::SnapshotNotFound(key.to_string()))?;
    if record.kind != Kind::Active {
        return Err(Error::FailedPrecondition(format!(
            "snapshot {} is {}, only active snapshots can be committed",
            key, record.kind
        )));
    }
    if state.is_taken(name) {
        return Err(Error::SnapshotAlreadyExists(name.to_string()));
    }
    Ok(record)
}

/// Runs filesystem work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("snapshot task failed: {}", e)))?
}

// =============================================================================
// Directory Helpers
// =============================================================================

/// Recursively copies `src` into the existing directory `dst`.
///
/// Symlinks are copied as links and hard-linked files stay linked to each
/// other. Special files are skipped. Directory modes are applied last so
/// read-only directories can still be filled.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    let mut dir_modes = Vec::new();
    #[cfg(unix)]
    let mut copied: HashMap<(u64, u64), PathBuf> = HashMap::new();

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            let perms = entry.metadata().map_err(|e| Error::Io(e.into()))?.permissions();
            dir_modes.push((target, perms));
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
            #[cfg(not(unix))]
            return Err(Error::NotSupported(format!(
                "cannot copy symlink {} -> {}",
                rel.display(),
                link.display()
            )));
        } else if file_type.is_file() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::MetadataExt;
                let meta = entry.metadata().map_err(|e| Error::Io(e.into()))?;
                if meta.nlink() > 1 {
                    match copied.entry((meta.dev(), meta.ino())) {
                        Entry::Occupied(first) => {
                            fs::hard_link(first.get(), &target)?;
                            continue;
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(target.clone());
                        }
                    }
                }
            }
            fs::copy(entry.path(), &target)?;
        } else {
            debug!("Skipping special file {}", rel.display());
        }
    }

    for (dir, perms) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, perms)?;
    }
    Ok(())
}

/// Sums regular-file bytes and counts entries under `dir`.
fn dir_usage(dir: &Path) -> Result<Usage> {
    let mut usage = Usage::default();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        usage.inodes += 1;
        if entry.file_type().is_file() {
            usage.size += entry.metadata().map_err(|e| Error::Io(e.into()))?.len();
        }
    }
    Ok(usage)
}
