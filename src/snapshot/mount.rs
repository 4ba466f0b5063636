//! Mount descriptions returned by snapshotters.
//!
//! No kernel mounts are performed. A bind mount names a host directory, and
//! consumers operate on that directory directly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A single mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount type (`bind`, `overlay`, ...).
    #[serde(rename = "type")]
    pub mount_type: String,
    /// Mount source.
    pub source: String,
    /// Optional target inside the rootfs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    /// Mount options.
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    /// Builds a recursive bind mount of `source`.
    pub fn bind(source: &Path, readonly: bool) -> Self {
        Self {
            mount_type: "bind".to_string(),
            source: source.to_string_lossy().into_owned(),
            target: String::new(),
            options: vec![
                "rbind".to_string(),
                if readonly { "ro" } else { "rw" }.to_string(),
            ],
        }
    }

    /// True if mounted read-only.
    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }

    fn is_bind(&self) -> bool {
        self.mount_type == "bind" || self.options.iter().any(|o| o == "bind" || o == "rbind")
    }
}

/// Resolves a mount set to the host directory it exposes.
///
/// Only a single bind mount without a target can be resolved; anything else
/// would need real mount syscalls.
pub fn resolve_dir(mounts: &[Mount]) -> Result<PathBuf> {
    let [mount] = mounts else {
        return Err(Error::NotSupported(format!(
            "cannot resolve {} mounts to a directory",
            mounts.len()
        )));
    };
    if !mount.is_bind() || !mount.target.is_empty() {
        return Err(Error::NotSupported(format!(
            "mount type '{}' requires a kernel mount",
            mount.mount_type
        )));
    }

    let dir = PathBuf::from(&mount.source);
    if !dir.is_dir() {
        return Err(Error::FailedPrecondition(format!(
            "mount source {} is not a directory",
            dir.display()
        )));
    }
    Ok(dir)
}

/// Like [`resolve_dir`], but refuses read-only mounts.
pub fn resolve_writable_dir(mounts: &[Mount]) -> Result<PathBuf> {
    if mounts.iter().any(Mount::is_readonly) {
        return Err(Error::FailedPrecondition(
            "cannot write to a read-only mount".to_string(),
        ));
    }
    resolve_dir(mounts)
}
