//! Tests for registry credential loading.

use magiksnap::credentials::normalize_host;
use magiksnap::{CredentialStore, Credentials, Error};
use std::fs;
use tempfile::TempDir;

// =============================================================================
// Host Normalization Tests
// =============================================================================

#[test]
fn test_normalize_host() {
    assert_eq!(normalize_host("https://index.docker.io/v1/"), "docker.io");
    assert_eq!(normalize_host("registry-1.docker.io"), "docker.io");
    assert_eq!(normalize_host("http://GHCR.io/owner"), "ghcr.io");
    assert_eq!(normalize_host("localhost:5000"), "localhost:5000");
}

// =============================================================================
// Parsing Tests
// =============================================================================

#[test]
fn test_auth_field_is_decoded() {
    let json = br#"{"auths": {"https://index.docker.io/v1/": {"auth": "dXNlcjpwYXNz"}}}"#;

    let store = CredentialStore::from_json(json).unwrap();

    let creds = store.lookup("docker.io").unwrap();
    assert_eq!(creds.username, "user");
    assert_eq!(creds.secret, "pass");
}

#[test]
fn test_identity_token_wins() {
    let json = br#"{"auths": {"ghcr.io": {
        "auth": "dXNlcjpwYXNz",
        "identitytoken": "tok"
    }}}"#;

    let store = CredentialStore::from_json(json).unwrap();

    assert_eq!(
        store.lookup("ghcr.io"),
        Some(Credentials {
            username: String::new(),
            secret: "tok".to_string(),
        })
    );
}

#[test]
fn test_username_password_fields() {
    let json = br#"{"auths": {"quay.io": {"username": "u", "password": "p"}}}"#;

    let store = CredentialStore::from_json(json).unwrap();

    assert_eq!(store.lookup("https://quay.io").unwrap().secret, "p");
}

#[test]
fn test_entries_without_credentials_are_skipped() {
    let json = br#"{"auths": {"empty.io": {}}, "credsStore": "desktop"}"#;

    let store = CredentialStore::from_json(json).unwrap();

    assert!(store.is_empty());
    assert!(store.lookup("empty.io").is_none());
}

#[test]
fn test_invalid_auth_rejected() {
    let not_base64 = br#"{"auths": {"a.io": {"auth": "***"}}}"#;
    let no_colon = br#"{"auths": {"a.io": {"auth": "dXNlcg=="}}}"#;

    assert!(matches!(
        CredentialStore::from_json(not_base64),
        Err(Error::InvalidCredentials { .. })
    ));
    assert!(matches!(
        CredentialStore::from_json(no_colon),
        Err(Error::InvalidCredentials { .. })
    ));
    assert!(CredentialStore::from_json(b"not json").is_err());
}

#[test]
fn test_debug_redacts_secret() {
    let creds = Credentials {
        username: "user".to_string(),
        secret: "hunter2".to_string(),
    };

    let rendered = format!("{creds:?}");

    assert!(rendered.contains("user"));
    assert!(!rendered.contains("hunter2"));
}

// =============================================================================
// File Tests
// =============================================================================

#[test]
fn test_load_from_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.json");
    fs::write(&path, r#"{"auths": {"ghcr.io": {"auth": "dXNlcjpwYXNz"}}}"#).unwrap();

    let store = CredentialStore::load(&path).unwrap();

    assert_eq!(store.len(), 1);
}

#[test]
fn test_load_missing_file_is_empty() {
    let temp = TempDir::new().unwrap();

    let store = CredentialStore::load(&temp.path().join("absent.json")).unwrap();

    assert!(store.is_empty());
}

#[test]
fn test_insert_normalizes_host() {
    let mut store = CredentialStore::default();
    store.insert(
        "https://index.docker.io/v1/",
        Credentials {
            username: "u".to_string(),
            secret: "s".to_string(),
        },
    );

    assert!(store.lookup("registry-1.docker.io").is_some());
}
