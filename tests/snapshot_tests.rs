//! Tests for the directory-copy snapshotter.
//!
//! Validates the prepare/view/commit/remove lifecycle, parent rules,
//! metadata persistence, and mount resolution.

use magiksnap::snapshot::mount;
use magiksnap::{Error, Kind, Mount, NaiveSnapshotter, Snapshotter};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

fn snapshotter() -> (TempDir, NaiveSnapshotter) {
    let temp_dir = TempDir::new().unwrap();
    let sn = NaiveSnapshotter::with_path(temp_dir.path().join("snapshots")).unwrap();
    (temp_dir, sn)
}

fn dir_of(mounts: &[Mount]) -> PathBuf {
    mount::resolve_dir(mounts).unwrap()
}

/// Prepares `key` on `parent`, writes one file and commits it as `name`.
async fn commit_with_file(
    sn: &NaiveSnapshotter,
    name: &str,
    parent: Option<&str>,
    file: &str,
    data: &str,
) {
    let key = format!("{}-active", name);
    let mounts = sn.prepare(&key, parent, HashMap::new()).await.unwrap();
    fs::write(dir_of(&mounts).join(file), data).unwrap();
    sn.commit(name, &key, HashMap::new()).await.unwrap();
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_prepare_returns_writable_bind_mount() {
    let (_temp, sn) = snapshotter();

    let mounts = sn.prepare("work", None, HashMap::new()).await.unwrap();

    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].mount_type, "bind");
    assert!(!mounts[0].is_readonly());
    assert!(mount::resolve_writable_dir(&mounts).is_ok());

    let info = sn.stat("work").await.unwrap();
    assert_eq!(info.kind, Kind::Active);
    assert_eq!(info.parent, None);
}

#[tokio::test]
async fn test_commit_and_child_sees_parent_content() {
    let (_temp, sn) = snapshotter();
    commit_with_file(&sn, "base", None, "hello", "world").await;

    let mounts = sn.prepare("child", Some("base"), HashMap::new()).await.unwrap();
    let dir = dir_of(&mounts);

    assert_eq!(fs::read_to_string(dir.join("hello")).unwrap(), "world");
    assert!(sn.stat("base-active").await.unwrap_err().is_not_found(), "key is renamed on commit");
    assert_eq!(sn.stat("base").await.unwrap().kind, Kind::Committed);
    assert_eq!(sn.stat("child").await.unwrap().parent.as_deref(), Some("base"));
}

#[tokio::test]
async fn test_child_writes_do_not_leak_into_parent() {
    let (_temp, sn) = snapshotter();
    commit_with_file(&sn, "base", None, "file", "original").await;

    let mounts = sn.prepare("child", Some("base"), HashMap::new()).await.unwrap();
    fs::write(dir_of(&mounts).join("file"), "changed").unwrap();

    let view = sn.view("peek", Some("base"), HashMap::new()).await.unwrap();
    assert!(view[0].is_readonly());
    assert_eq!(fs::read_to_string(dir_of(&view).join("file")).unwrap(), "original");
}

#[tokio::test]
async fn test_commit_labels_merge() {
    let (_temp, sn) = snapshotter();
    let mut prepare_labels = HashMap::new();
    prepare_labels.insert("a".to_string(), "1".to_string());
    sn.prepare("key", None, prepare_labels).await.unwrap();

    let mut commit_labels = HashMap::new();
    commit_labels.insert("b".to_string(), "2".to_string());
    sn.commit("name", "key", commit_labels).await.unwrap();

    let info = sn.stat("name").await.unwrap();
    assert_eq!(info.labels.get("a").map(String::as_str), Some("1"));
    assert_eq!(info.labels.get("b").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn test_update_labels() {
    let (_temp, sn) = snapshotter();
    sn.prepare("key", None, HashMap::new()).await.unwrap();

    let mut labels = HashMap::new();
    labels.insert("x".to_string(), "y".to_string());
    let info = sn.update_labels("key", labels).await.unwrap();

    assert_eq!(info.labels.get("x").map(String::as_str), Some("y"));
    assert!(sn.update_labels("missing", HashMap::new()).await.unwrap_err().is_not_found());
}

// =============================================================================
// Error Classification Tests
// =============================================================================

#[tokio::test]
async fn test_duplicate_key_already_exists() {
    let (_temp, sn) = snapshotter();
    sn.prepare("dup", None, HashMap::new()).await.unwrap();

    let err = sn.prepare("dup", None, HashMap::new()).await.unwrap_err();

    assert!(err.is_already_exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_prepare_of_same_key() {
    let (_temp, sn) = snapshotter();
    commit_with_file(&sn, "base", None, "f", "x").await;
    let sn = Arc::new(sn);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let sn = Arc::clone(&sn);
            tokio::spawn(async move { sn.prepare("race", Some("base"), HashMap::new()).await })
        })
        .collect();

    let mut created = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => created += 1,
            Err(e) => assert!(e.is_already_exists(), "unexpected error: {e}"),
        }
    }

    assert_eq!(created, 1);
    assert_eq!(sn.walk().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_missing_parent_not_found() {
    let (_temp, sn) = snapshotter();

    let err = sn.prepare("key", Some("ghost"), HashMap::new()).await.unwrap_err();

    assert!(err.is_not_found());
    assert!(sn.walk().await.unwrap().is_empty(), "nothing is created on failure");
}

#[tokio::test]
async fn test_active_parent_is_failed_precondition() {
    let (_temp, sn) = snapshotter();
    sn.prepare("active", None, HashMap::new()).await.unwrap();

    let err = sn.prepare("child", Some("active"), HashMap::new()).await.unwrap_err();

    assert!(err.is_failed_precondition());
}

#[tokio::test]
async fn test_commit_rules() {
    let (_temp, sn) = snapshotter();
    commit_with_file(&sn, "base", None, "f", "x").await;
    sn.prepare("other", None, HashMap::new()).await.unwrap();
    sn.view("ro", Some("base"), HashMap::new()).await.unwrap();

    assert!(sn.commit("base", "other", HashMap::new()).await.unwrap_err().is_already_exists());
    assert!(sn.commit("x", "ro", HashMap::new()).await.unwrap_err().is_failed_precondition());
    assert!(sn.commit("x", "base", HashMap::new()).await.unwrap_err().is_failed_precondition());
    assert!(sn.commit("x", "missing", HashMap::new()).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_committed_snapshot_has_no_mounts() {
    let (_temp, sn) = snapshotter();
    commit_with_file(&sn, "base", None, "f", "x").await;

    let err = sn.mounts("base").await.unwrap_err();

    assert!(err.is_failed_precondition());
}

#[tokio::test]
async fn test_invalid_key_rejected() {
    let (_temp, sn) = snapshotter();

    assert!(sn.prepare("", None, HashMap::new()).await.is_err());
    assert!(sn.prepare("bad\nkey", None, HashMap::new()).await.is_err());
}

// =============================================================================
// Remove Tests
// =============================================================================

#[tokio::test]
async fn test_remove_with_child_fails() {
    let (_temp, sn) = snapshotter();
    commit_with_file(&sn, "base", None, "f", "x").await;
    sn.prepare("child", Some("base"), HashMap::new()).await.unwrap();

    let err = sn.remove("base").await.unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)));

    sn.remove("child").await.unwrap();
    sn.remove("base").await.unwrap();
    assert!(sn.walk().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_deletes_directory() {
    let (_temp, sn) = snapshotter();
    let mounts = sn.prepare("gone", None, HashMap::new()).await.unwrap();
    let dir = dir_of(&mounts);

    sn.remove("gone").await.unwrap();

    assert!(!dir.exists());
    assert!(sn.remove("gone").await.unwrap_err().is_not_found());
}

// =============================================================================
// Usage and Persistence Tests
// =============================================================================

#[tokio::test]
async fn test_usage_counts_file_bytes() {
    let (_temp, sn) = snapshotter();
    commit_with_file(&sn, "base", None, "data", "12345").await;

    let usage = sn.usage("base").await.unwrap();

    assert_eq!(usage.size, 5);
    assert!(usage.inodes >= 2);
}

#[tokio::test]
async fn test_metadata_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("snapshots");
    {
        let sn = NaiveSnapshotter::with_path(root.clone()).unwrap();
        commit_with_file(&sn, "base", None, "f", "x").await;
        sn.prepare("active", Some("base"), HashMap::new()).await.unwrap();
    }

    let sn = NaiveSnapshotter::with_path(root).unwrap();
    let names: Vec<String> = sn.walk().await.unwrap().into_iter().map(|i| i.name).collect();

    assert_eq!(names, vec!["active".to_string(), "base".to_string()]);
    let mounts = sn.mounts("active").await.unwrap();
    assert_eq!(fs::read_to_string(dir_of(&mounts).join("f")).unwrap(), "x");
}

#[cfg(unix)]
#[tokio::test]
async fn test_child_keeps_hard_links() {
    use std::os::unix::fs::MetadataExt;

    let (_temp, sn) = snapshotter();
    let mounts = sn.prepare("base-active", None, HashMap::new()).await.unwrap();
    let dir = dir_of(&mounts);
    fs::write(dir.join("a"), "shared").unwrap();
    fs::hard_link(dir.join("a"), dir.join("b")).unwrap();
    sn.commit("base", "base-active", HashMap::new()).await.unwrap();

    let mounts = sn.prepare("child", Some("base"), HashMap::new()).await.unwrap();
    let child = dir_of(&mounts);

    let a = fs::metadata(child.join("a")).unwrap();
    let b = fs::metadata(child.join("b")).unwrap();
    assert_eq!(a.ino(), b.ino());
    assert_eq!(a.nlink(), 2);
    assert_eq!(fs::read_to_string(child.join("b")).unwrap(), "shared");
}

#[tokio::test]
async fn test_snapshotter_name() {
    let (_temp, sn) = snapshotter();
    assert_eq!(sn.name(), "naive");
}
