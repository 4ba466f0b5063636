//! # Layer Archives
//!
//! Applies OCI layer tarballs to a directory and produces layer tarballs
//! from the difference between two directories.
//!
//! ## Whiteouts
//!
//! Layers mark deletions with special entries:
//!
//! - `.wh.<name>` removes `<name>` (file or whole directory) inherited from
//!   lower layers.
//! - `.wh..wh..opq` in a directory hides everything the lower layers put
//!   there, at any depth. Entries added by the same layer survive, whether
//!   they come before or after the marker in the stream.
//! - A whiteout naming `.` or `..` (or nothing) fails with
//!   [`Error::PathTraversal`].
//!
//! ## Security
//!
//! Layer content is untrusted:
//!
//! - Entry names with `..`, a root, or a drive prefix fail with
//!   [`Error::PathTraversal`].
//! - Entries whose parent path goes through a symlink are rejected, so a
//!   layer cannot plant `etc -> /etc` and then write `etc/passwd`.
//! - Hard-link targets are sanitized the same way and must exist in the
//!   root.
//! - Entry count and accumulated file bytes are bounded by
//!   [`MAX_FILES_PER_LAYER`] and [`MAX_ROOTFS_SIZE`].
//! - Device nodes are skipped.

use crate::constants::{
    MAX_FILES_PER_LAYER, MAX_ROOTFS_SIZE, WHITEOUT_META_PREFIX, WHITEOUT_OPAQUE, WHITEOUT_PREFIX,
};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::fs::{self, File, Metadata};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;
use walkdir::WalkDir;

/// Bounds enforced while applying a layer.
#[derive(Debug, Clone, Copy)]
pub struct ApplyLimits {
    /// Maximum number of tar entries.
    pub max_entries: usize,
    /// Maximum accumulated regular-file bytes.
    pub max_size: u64,
}

impl Default for ApplyLimits {
    fn default() -> Self {
        Self {
            max_entries: MAX_FILES_PER_LAYER,
            max_size: MAX_ROOTFS_SIZE,
        }
    }
}

// =============================================================================
// Apply
// =============================================================================

/// Applies a tar stream to `root` with the default limits.
///
/// Returns the number of regular-file bytes written.
pub fn apply<R: Read>(root: &Path, reader: R) -> Result<u64> {
    apply_with_limits(root, reader, ApplyLimits::default())
}

/// Applies a tar stream to `root`.
pub fn apply_with_limits<R: Read>(root: &Path, reader: R, limits: ApplyLimits) -> Result<u64> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    // Paths (and their ancestors) written by this layer; opaque markers must
    // not remove them, but still clear lower content inside kept directories.
    let mut added: HashSet<PathBuf> = HashSet::new();
    let mut total_size = 0u64;
    let mut count = 0usize;

    for entry in archive.entries()? {
        let mut entry = entry?;

        count += 1;
        if count > limits.max_entries {
            return Err(Error::SizeLimitExceeded {
                size: count as u64,
                limit: limits.max_entries as u64,
            });
        }

        let rel = sanitize(&entry.path()?)?;
        let Some(name) = rel.file_name() else {
            // The archive root itself ("./").
            continue;
        };
        let parent = rel.parent().unwrap_or(Path::new("")).to_path_buf();

        if name.as_encoded_bytes() == WHITEOUT_OPAQUE.as_bytes() {
            check_parents(root, &rel)?;
            let dir = root.join(&parent);
            if dir.is_dir() {
                debug!(dir = %parent.display(), "applying opaque whiteout");
                clear_lower(&dir, &parent, &added)?;
            }
            continue;
        }

        if let Some(target) = whiteout_target(name) {
            if name.as_encoded_bytes().starts_with(WHITEOUT_META_PREFIX.as_bytes()) {
                debug!(entry = %rel.display(), "ignoring whiteout metadata entry");
                continue;
            }
            // `.wh.`, `.wh..` and `.wh...` would name the directory itself or
            // its parent.
            if target.is_empty() || target == "." || target == ".." {
                return Err(Error::PathTraversal {
                    path: rel.display().to_string(),
                });
            }
            let target_rel = parent.join(target);
            check_parents(root, &target_rel)?;
            debug!(target = %target_rel.display(), "applying whiteout");
            remove_any(&root.join(&target_rel))?;
            continue;
        }

        let entry_type = entry.header().entry_type();
        if matches!(entry_type, EntryType::Char | EntryType::Block) {
            debug!(entry = %rel.display(), "skipping device node");
            continue;
        }

        if entry_type.is_file() {
            total_size += entry.size();
            if total_size > limits.max_size {
                return Err(Error::SizeLimitExceeded {
                    size: total_size,
                    limit: limits.max_size,
                });
            }
        }

        check_parents(root, &rel)?;
        let dest = root.join(&rel);
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir)?;
        }

        // A directory merges into an existing directory; anything else
        // replaces whatever is there.
        if let Ok(existing) = fs::symlink_metadata(&dest)
            && !(existing.is_dir() && entry_type.is_dir())
        {
            remove_any(&dest)?;
        }

        if entry_type.is_hard_link() {
            let link = entry
                .link_name()?
                .ok_or_else(|| Error::LayerExtractionFailed {
                    digest: rel.display().to_string(),
                    reason: "hard link without target".to_string(),
                })?;
            let link_rel = sanitize(&link)?;
            check_parents(root, &link_rel)?;
            let source = root.join(&link_rel);
            let meta = fs::symlink_metadata(&source).map_err(|_| Error::LayerExtractionFailed {
                digest: rel.display().to_string(),
                reason: format!("hard link target {} does not exist", link_rel.display()),
            })?;
            if meta.is_dir() {
                return Err(Error::LayerExtractionFailed {
                    digest: rel.display().to_string(),
                    reason: "hard link to a directory".to_string(),
                });
            }
            fs::hard_link(&source, &dest)?;
        } else {
            entry.unpack(&dest)?;
        }

        for ancestor in rel.ancestors() {
            if ancestor.as_os_str().is_empty() || !added.insert(ancestor.to_path_buf()) {
                break;
            }
        }
    }

    Ok(total_size)
}

/// Normalizes a tar entry path to a relative path without `.` components.
fn sanitize(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal {
                    path: path.display().to_string(),
                });
            }
        }
    }
    Ok(out)
}

/// Ensures no existing ancestor of `rel` (below `root`) is a symlink.
fn check_parents(root: &Path, rel: &Path) -> Result<()> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    let mut current = root.to_path_buf();
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::PathTraversal {
                    path: rel.display().to_string(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Removes a file, symlink or directory tree. Missing paths are fine.
fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Strips the whiteout prefix from an entry name.
fn whiteout_target(name: &OsStr) -> Option<&OsStr> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        name.as_bytes()
            .strip_prefix(WHITEOUT_PREFIX.as_bytes())
            .map(OsStr::from_bytes)
    }
    #[cfg(not(unix))]
    {
        name.to_str()?.strip_prefix(WHITEOUT_PREFIX).map(OsStr::new)
    }
}

/// Removes everything below `dir` that this layer did not add.
///
/// Directories the layer added (or merged into) are descended into, since
/// lower-layer content inside them is hidden too.
fn clear_lower(dir: &Path, rel_dir: &Path, keep: &HashSet<PathBuf>) -> Result<()> {
    for child in fs::read_dir(dir)? {
        let child = child?;
        let rel = rel_dir.join(child.file_name());
        if !keep.contains(&rel) {
            remove_any(&child.path())?;
        } else if child.file_type()?.is_dir() {
            clear_lower(&child.path(), &rel, keep)?;
        }
    }
    Ok(())
}

// =============================================================================
// Diff
// =============================================================================

/// A single change between two trees.
enum Change {
    /// Entry added or modified in the upper tree.
    Upsert(PathBuf),
    /// Entry removed; the key is the whiteout path.
    Delete,
}

/// Writes a tar stream transforming `lower` into `upper` and returns the
/// writer.
///
/// Entries are emitted in path order so a parent directory always precedes
/// its children. Hard links in `upper` are written as independent files.
pub fn write_diff<W: Write>(lower: &Path, upper: &Path, writer: W) -> Result<W> {
    let changes = collect_changes(lower, upper)?;

    let mut builder = Builder::new(writer);
    builder.follow_symlinks(false);

    for (path, change) in &changes {
        match change {
            Change::Upsert(rel) => {
                builder
                    .append_path_with_name(upper.join(rel), rel)
                    .map_err(|e| Error::DiffFailed(format!("{}: {}", rel.display(), e)))?;
            }
            Change::Delete => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Regular);
                header.set_size(0);
                header.set_mode(0o644);
                header.set_mtime(0);
                builder.append_data(&mut header, path, io::empty())?;
            }
        }
    }

    debug!(changes = changes.len(), "wrote diff");
    Ok(builder.into_inner()?)
}

fn collect_changes(lower: &Path, upper: &Path) -> Result<BTreeMap<PathBuf, Change>> {
    let mut changes = BTreeMap::new();

    for entry in WalkDir::new(upper).min_depth(1).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let rel = relative(upper, entry.path())?;
        let upper_meta = fs::symlink_metadata(entry.path())?;

        let changed = match fs::symlink_metadata(lower.join(&rel)) {
            Ok(lower_meta) => {
                differs(&lower.join(&rel), &lower_meta, entry.path(), &upper_meta)?
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
                true
            }
            Err(e) => return Err(e.into()),
        };
        if changed {
            changes.insert(rel.clone(), Change::Upsert(rel));
        }
    }

    let mut walker = WalkDir::new(lower)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let rel = relative(lower, entry.path())?;
        let is_dir = entry.file_type().is_dir();

        match fs::symlink_metadata(upper.join(&rel)) {
            Ok(upper_meta) => {
                // A directory replaced by a non-directory is fully covered by
                // the upsert of the replacement.
                if is_dir && !upper_meta.is_dir() {
                    walker.skip_current_dir();
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
                let name = rel
                    .file_name()
                    .ok_or_else(|| Error::DiffFailed(format!("bad path {}", rel.display())))?;
                let whiteout = rel.with_file_name(format!(
                    "{}{}",
                    WHITEOUT_PREFIX,
                    name.to_string_lossy()
                ));
                changes.insert(whiteout, Change::Delete);
                if is_dir {
                    walker.skip_current_dir();
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(changes)
}

fn relative(base: &Path, path: &Path) -> Result<PathBuf> {
    path.strip_prefix(base)
        .map(Path::to_path_buf)
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Compares one path across the two trees.
fn differs(lower: &Path, lm: &Metadata, upper: &Path, um: &Metadata) -> Result<bool> {
    let (lt, ut) = (lm.file_type(), um.file_type());
    if lt.is_dir() != ut.is_dir() || lt.is_symlink() != ut.is_symlink() || lt.is_file() != ut.is_file() {
        return Ok(true);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if !ut.is_symlink()
            && (lm.mode() & 0o7777 != um.mode() & 0o7777 || lm.uid() != um.uid() || lm.gid() != um.gid())
        {
            return Ok(true);
        }
    }

    if ut.is_symlink() {
        return Ok(fs::read_link(lower)? != fs::read_link(upper)?);
    }
    if ut.is_file() {
        if lm.len() != um.len() {
            return Ok(true);
        }
        return Ok(!same_content(lower, upper)?);
    }
    Ok(false)
}

fn same_content(a: &Path, b: &Path) -> Result<bool> {
    let mut ra = BufReader::new(File::open(a)?);
    let mut rb = BufReader::new(File::open(b)?);
    let mut ba = [0u8; 8192];
    let mut bb = [0u8; 8192];
    loop {
        let na = read_full(&mut ra, &mut ba)?;
        let nb = read_full(&mut rb, &mut bb)?;
        if na != nb || ba[..na] != bb[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

fn read_full(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
