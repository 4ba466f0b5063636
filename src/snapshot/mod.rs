//! # Snapshots
//!
//! A snapshotter manages a tree of filesystem snapshots keyed by string.
//!
//! ## Lifecycle
//!
//! ```text
//!               prepare(key, parent)             commit(name, key)
//!   parent ───────────────────────────► Active ───────────────────► Committed
//! (committed)                             │                          (name)
//!               view(key, parent)         │ remove(key)
//!   parent ───────────────────────────► View ──► (gone)
//! ```
//!
//! - **Active** snapshots are writable and may be committed once.
//! - **View** snapshots are read-only and can only be removed.
//! - **Committed** snapshots are immutable and may be used as parents.
//!
//! Only committed snapshots can be parents, and a snapshot with children
//! cannot be removed.
//!
//! ## Mounts
//!
//! Operations that hand out a snapshot return a mount set. See
//! [`mount::resolve_dir`] for how a mount set maps to a host directory.

pub mod mount;
pub mod naive;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub use mount::Mount;
pub use naive::NaiveSnapshotter;

/// Snapshot kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Read-only view of a committed snapshot.
    View,
    /// Writable snapshot that can be committed.
    Active,
    /// Immutable snapshot usable as a parent.
    Committed,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::View => write!(f, "view"),
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
        }
    }
}

/// Snapshot metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    /// Snapshot key (or committed name).
    pub name: String,
    /// Parent committed snapshot, if any.
    pub parent: Option<String>,
    /// Kind.
    pub kind: Kind,
    /// Labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last update time.
    pub updated: DateTime<Utc>,
}

/// Disk usage of a snapshot's own directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Bytes used by regular files.
    pub size: u64,
    /// Number of filesystem entries.
    pub inodes: u64,
}

/// Snapshot manager interface.
///
/// `parent` arguments accept `None` or an empty string for "no parent".
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Returns the snapshotter name.
    fn name(&self) -> &str;

    /// Returns metadata for `key`.
    async fn stat(&self, key: &str) -> Result<Info>;

    /// Merges labels into `key`. An empty value removes the label.
    async fn update_labels(&self, key: &str, labels: HashMap<String, String>) -> Result<Info>;

    /// Returns disk usage of `key`.
    async fn usage(&self, key: &str) -> Result<Usage>;

    /// Returns the mounts of an active snapshot or view.
    async fn mounts(&self, key: &str) -> Result<Vec<Mount>>;

    /// Creates a writable snapshot on top of `parent`.
    async fn prepare(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>>;

    /// Creates a read-only view of `parent`.
    async fn view(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>>;

    /// Commits the active snapshot `key` under `name`.
    async fn commit(&self, name: &str, key: &str, labels: HashMap<String, String>) -> Result<()>;

    /// Removes a snapshot that has no children.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Lists all snapshots, sorted by name.
    async fn walk(&self) -> Result<Vec<Info>>;
}
