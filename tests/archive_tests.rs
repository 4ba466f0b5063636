//! Tests for layer archive application and diff generation.
//!
//! Validates whiteout handling, path traversal protection, resource limits,
//! and that generated diffs reproduce the upper tree.

use magiksnap::Error;
use magiksnap::archive::{self, ApplyLimits};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn layer(build: impl FnOnce(&mut Builder<Vec<u8>>)) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    build(&mut builder);
    builder.into_inner().unwrap()
}

fn add_file(b: &mut Builder<Vec<u8>>, path: &str, data: &[u8]) {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    b.append_data(&mut header, path, data).unwrap();
}

fn add_dir(b: &mut Builder<Vec<u8>>, path: &str) {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(0);
    b.append_data(&mut header, path, io::empty()).unwrap();
}

fn add_link(b: &mut Builder<Vec<u8>>, kind: EntryType, path: &str, target: &str) {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(0);
    header.set_mode(0o777);
    header.set_mtime(0);
    header.set_link_name(target).unwrap();
    b.append_data(&mut header, path, io::empty()).unwrap();
}

/// Appends an entry with a raw name, bypassing the builder's path checks.
fn add_raw(b: &mut Builder<Vec<u8>>, raw_name: &[u8], data: &[u8]) {
    let mut header = Header::new_old();
    header.as_old_mut().name[..raw_name.len()].copy_from_slice(raw_name);
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    b.append(&header, data).unwrap();
}

fn entry_names(tar_bytes: &[u8]) -> BTreeSet<String> {
    let mut archive = Archive::new(tar_bytes);
    archive
        .entries()
        .unwrap()
        .map(|e| {
            e.unwrap()
                .path()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string()
        })
        .collect()
}

fn write(root: &Path, rel: &str, data: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

// =============================================================================
// Apply Tests
// =============================================================================

#[test]
fn test_apply_creates_entries() {
    let root = TempDir::new().unwrap();
    let tar_bytes = layer(|b| {
        add_dir(b, "etc");
        add_file(b, "etc/hostname", b"magik\n");
        add_file(b, "usr/bin/tool", b"#!/bin/sh\n");
        add_link(b, EntryType::Symlink, "bin", "usr/bin");
    });

    let written = archive::apply(root.path(), tar_bytes.as_slice()).unwrap();

    assert_eq!(written, 16);
    assert_eq!(fs::read_to_string(root.path().join("etc/hostname")).unwrap(), "magik\n");
    assert!(root.path().join("usr/bin/tool").is_file(), "parents are created on demand");
    assert_eq!(
        fs::read_link(root.path().join("bin")).unwrap(),
        Path::new("usr/bin")
    );
}

#[test]
fn test_apply_overwrites_lower_file() {
    let root = TempDir::new().unwrap();
    write(root.path(), "etc/motd", "old");

    let tar_bytes = layer(|b| add_file(b, "etc/motd", b"new"));
    archive::apply(root.path(), tar_bytes.as_slice()).unwrap();

    assert_eq!(fs::read_to_string(root.path().join("etc/motd")).unwrap(), "new");
}

#[test]
fn test_apply_file_replaces_directory() {
    let root = TempDir::new().unwrap();
    write(root.path(), "opt/app/config", "x");

    let tar_bytes = layer(|b| add_file(b, "opt/app", b"now a file"));
    archive::apply(root.path(), tar_bytes.as_slice()).unwrap();

    assert!(root.path().join("opt/app").is_file());
}

// =============================================================================
// Whiteout Tests
// =============================================================================

#[test]
fn test_whiteout_removes_file_and_directory() {
    let root = TempDir::new().unwrap();
    write(root.path(), "etc/passwd", "root");
    write(root.path(), "var/cache/a", "1");
    write(root.path(), "var/cache/b", "2");

    let tar_bytes = layer(|b| {
        add_file(b, "etc/.wh.passwd", b"");
        add_file(b, "var/.wh.cache", b"");
    });
    archive::apply(root.path(), tar_bytes.as_slice()).unwrap();

    assert!(!root.path().join("etc/passwd").exists());
    assert!(!root.path().join("var/cache").exists());
    assert!(root.path().join("var").is_dir(), "only the whited-out entry goes");
    assert!(!root.path().join("etc/.wh.passwd").exists(), "whiteouts are not materialized");
}

#[test]
fn test_whiteout_of_missing_path_is_ignored() {
    let root = TempDir::new().unwrap();
    let tar_bytes = layer(|b| add_file(b, "nothing/.wh.here", b""));

    assert!(archive::apply(root.path(), tar_bytes.as_slice()).is_ok());
}

#[test]
fn test_opaque_whiteout_keeps_same_layer_entries() {
    let root = TempDir::new().unwrap();
    write(root.path(), "app/lower1", "l");
    write(root.path(), "app/lower2", "l");
    write(root.path(), "other/keep", "k");

    let tar_bytes = layer(|b| {
        add_dir(b, "app");
        add_file(b, "app/before", b"b");
        add_file(b, "app/.wh..wh..opq", b"");
        add_file(b, "app/after", b"a");
    });
    archive::apply(root.path(), tar_bytes.as_slice()).unwrap();

    let mut names: Vec<String> = fs::read_dir(root.path().join("app"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["after", "before"]);
    assert!(root.path().join("other/keep").exists(), "opaque is scoped to its directory");
}

#[test]
fn test_opaque_after_nested_entries_clears_lower_subdirs() {
    let root = TempDir::new().unwrap();
    write(root.path(), "app/sub/old", "l");
    write(root.path(), "app/sub/deeper/older", "l");

    let tar_bytes = layer(|b| {
        add_dir(b, "app");
        add_dir(b, "app/sub");
        add_file(b, "app/sub/new", b"n");
        add_file(b, "app/.wh..wh..opq", b"");
    });
    archive::apply(root.path(), tar_bytes.as_slice()).unwrap();

    assert!(root.path().join("app/sub/new").exists());
    assert!(!root.path().join("app/sub/old").exists());
    assert!(!root.path().join("app/sub/deeper").exists());
}

#[cfg(unix)]
#[test]
fn test_non_utf8_entry_name_is_unpacked() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let root = TempDir::new().unwrap();
    let tar_bytes = layer(|b| add_raw(b, b"caf\xe9", b"data"));

    archive::apply(root.path(), tar_bytes.as_slice()).unwrap();

    let path = root.path().join(OsStr::from_bytes(b"caf\xe9"));
    assert_eq!(fs::read(path).unwrap(), b"data");
}

#[test]
fn test_whiteout_meta_entries_are_skipped() {
    let root = TempDir::new().unwrap();
    write(root.path(), ".wh..plnk", "keep");

    let tar_bytes = layer(|b| add_file(b, ".wh..wh..plnk", b""));
    archive::apply(root.path(), tar_bytes.as_slice()).unwrap();

    assert!(root.path().join(".wh..plnk").exists());
}

// =============================================================================
// Security Tests
// =============================================================================

#[test]
fn test_whiteout_of_parent_dir_rejected() {
    let base = TempDir::new().unwrap();
    let root = base.path().join("rootfs");
    fs::create_dir(&root).unwrap();
    write(base.path(), "victim/data", "keep");

    let tar_bytes = layer(|b| add_raw(b, b".wh...", b""));
    let result = archive::apply(&root, tar_bytes.as_slice());

    assert!(matches!(result, Err(Error::PathTraversal { .. })));
    assert!(root.exists());
    assert!(base.path().join("victim/data").exists());
}

#[test]
fn test_whiteout_of_current_dir_rejected() {
    let root = TempDir::new().unwrap();
    write(root.path(), "etc/passwd", "root");
    write(root.path(), "etc/hosts", "localhost");

    let tar_bytes = layer(|b| add_raw(b, b"etc/.wh..", b""));
    let result = archive::apply(root.path(), tar_bytes.as_slice());

    assert!(matches!(result, Err(Error::PathTraversal { .. })));
    assert!(root.path().join("etc/passwd").exists());
    assert!(root.path().join("etc/hosts").exists());
}

#[test]
fn test_empty_whiteout_name_rejected() {
    let root = TempDir::new().unwrap();
    write(root.path(), "etc/passwd", "root");

    let tar_bytes = layer(|b| add_raw(b, b"etc/.wh.", b""));
    let result = archive::apply(root.path(), tar_bytes.as_slice());

    assert!(matches!(result, Err(Error::PathTraversal { .. })));
    assert!(root.path().join("etc/passwd").exists());
}

#[test]
fn test_parent_traversal_rejected() {
    let root = TempDir::new().unwrap();
    let tar_bytes = layer(|b| add_raw(b, b"../escape", b"x"));

    let result = archive::apply(root.path(), tar_bytes.as_slice());

    assert!(matches!(result, Err(Error::PathTraversal { .. })));
    assert!(!root.path().parent().unwrap().join("escape").exists());
}

#[test]
fn test_write_through_symlink_rejected() {
    let outside = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let target = outside.path().to_string_lossy().into_owned();

    let tar_bytes = layer(|b| {
        add_link(b, EntryType::Symlink, "etc", &target);
        add_file(b, "etc/passwd", b"owned");
    });
    let result = archive::apply(root.path(), tar_bytes.as_slice());

    assert!(matches!(result, Err(Error::PathTraversal { .. })));
    assert!(!outside.path().join("passwd").exists());
}

#[test]
fn test_hard_link_within_root() {
    let root = TempDir::new().unwrap();
    let tar_bytes = layer(|b| {
        add_file(b, "bin/busybox", b"elf");
        add_link(b, EntryType::Link, "bin/sh", "bin/busybox");
    });
    archive::apply(root.path(), tar_bytes.as_slice()).unwrap();

    assert_eq!(fs::read(root.path().join("bin/sh")).unwrap(), b"elf");
}

#[test]
fn test_hard_link_to_missing_target_fails() {
    let root = TempDir::new().unwrap();
    let tar_bytes = layer(|b| add_link(b, EntryType::Link, "bin/sh", "bin/missing"));

    let result = archive::apply(root.path(), tar_bytes.as_slice());

    assert!(matches!(result, Err(Error::LayerExtractionFailed { .. })));
}

#[test]
fn test_entry_limit_enforced() {
    let root = TempDir::new().unwrap();
    let tar_bytes = layer(|b| {
        for i in 0..5 {
            add_file(b, &format!("f{}", i), b"x");
        }
    });
    let limits = ApplyLimits {
        max_entries: 3,
        ..ApplyLimits::default()
    };

    let result = archive::apply_with_limits(root.path(), tar_bytes.as_slice(), limits);

    assert!(matches!(result, Err(Error::SizeLimitExceeded { limit: 3, .. })));
}

#[test]
fn test_size_limit_enforced() {
    let root = TempDir::new().unwrap();
    let tar_bytes = layer(|b| {
        add_file(b, "a", &[0u8; 600]);
        add_file(b, "b", &[0u8; 600]);
    });
    let limits = ApplyLimits {
        max_size: 1000,
        ..ApplyLimits::default()
    };

    let result = archive::apply_with_limits(root.path(), tar_bytes.as_slice(), limits);

    assert!(matches!(
        result,
        Err(Error::SizeLimitExceeded { size: 1200, limit: 1000 })
    ));
}

// =============================================================================
// Diff Tests
// =============================================================================

#[test]
fn test_write_diff_lists_changes() {
    let lower = TempDir::new().unwrap();
    let upper = TempDir::new().unwrap();
    for root in [lower.path(), upper.path()] {
        write(root, "same", "unchanged");
        write(root, "modified", "v1");
        write(root, "gone", "bye");
        write(root, "olddir/a", "1");
        write(root, "olddir/nested/b", "2");
    }
    fs::write(upper.path().join("modified"), "v2").unwrap();
    fs::remove_file(upper.path().join("gone")).unwrap();
    fs::remove_dir_all(upper.path().join("olddir")).unwrap();
    write(upper.path(), "added/file", "new");

    let tar_bytes = archive::write_diff(lower.path(), upper.path(), Vec::new()).unwrap();
    let names = entry_names(&tar_bytes);

    let expected: BTreeSet<String> = ["added", "added/file", "modified", ".wh.gone", ".wh.olddir"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(names, expected, "only the top-most deleted path gets a whiteout");
}

#[test]
fn test_write_diff_of_identical_trees_is_empty() {
    let lower = TempDir::new().unwrap();
    let upper = TempDir::new().unwrap();
    for root in [lower.path(), upper.path()] {
        write(root, "etc/hosts", "127.0.0.1 localhost");
    }

    let tar_bytes = archive::write_diff(lower.path(), upper.path(), Vec::new()).unwrap();

    assert!(entry_names(&tar_bytes).is_empty());
}

#[test]
fn test_diff_applied_to_lower_reproduces_upper() {
    let lower = TempDir::new().unwrap();
    let upper = TempDir::new().unwrap();
    for root in [lower.path(), upper.path()] {
        write(root, "keep", "k");
        write(root, "drop/x", "x");
        write(root, "edit", "before");
    }
    fs::remove_dir_all(upper.path().join("drop")).unwrap();
    fs::write(upper.path().join("edit"), "after").unwrap();
    write(upper.path(), "fresh/y", "y");

    let tar_bytes = archive::write_diff(lower.path(), upper.path(), Vec::new()).unwrap();
    archive::apply(lower.path(), tar_bytes.as_slice()).unwrap();

    assert!(!lower.path().join("drop").exists());
    assert_eq!(fs::read_to_string(lower.path().join("edit")).unwrap(), "after");
    assert_eq!(fs::read_to_string(lower.path().join("fresh/y")).unwrap(), "y");
    assert_eq!(fs::read_to_string(lower.path().join("keep")).unwrap(), "k");
}
