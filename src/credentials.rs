//! Registry credentials from a Docker-style `config.json`.
//!
//! Only the static `auths` map is read; credential helpers are not run.
//!
//! ```json
//! { "auths": { "https://index.docker.io/v1/": { "auth": "dXNlcjpwYXNz" } } }
//! ```

use crate::error::{Error, Result};
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Canonical name for Docker Hub.
const DOCKER_HUB: &str = "docker.io";

const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

/// Username and secret for one registry host.
///
/// For identity tokens the username is empty and the token is the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "identitytoken")]
    identity_token: Option<String>,
}

impl AuthEntry {
    fn credentials(&self, host: &str) -> Result<Option<Credentials>> {
        if let Some(token) = self.identity_token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Some(Credentials {
                username: String::new(),
                secret: token.to_string(),
            }));
        }
        if let Some(auth) = self.auth.as_deref().filter(|a| !a.is_empty()) {
            return decode_auth(host, auth).map(Some);
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(Some(Credentials {
                username: username.clone(),
                secret: password.clone(),
            })),
            _ => Ok(None),
        }
    }
}

fn decode_auth(host: &str, auth: &str) -> Result<Credentials> {
    let invalid = |reason: String| Error::InvalidCredentials {
        host: host.to_string(),
        reason,
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth.trim())
        .map_err(|e| invalid(format!("auth is not base64: {}", e)))?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid("auth is not utf-8".to_string()))?;
    let (username, secret) = decoded
        .split_once(':')
        .ok_or_else(|| invalid("auth is not user:secret".to_string()))?;
    Ok(Credentials {
        username: username.to_string(),
        secret: secret.to_string(),
    })
}

/// Normalizes a registry reference to a bare host.
///
/// The scheme and path are dropped, and Docker Hub aliases collapse to
/// `docker.io`.
pub fn normalize_host(host: &str) -> String {
    let host = host
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or_default().to_ascii_lowercase();
    if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
        DOCKER_HUB.to_string()
    } else {
        host
    }
}

/// Credentials keyed by normalized host.
#[derive(Debug, Default, Clone)]
pub struct CredentialStore {
    entries: HashMap<String, Credentials>,
}

impl CredentialStore {
    /// Parses a `config.json` document.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let file: ConfigFile = serde_json::from_slice(data)?;
        let mut store = Self::default();
        for (host, entry) in &file.auths {
            match entry.credentials(host)? {
                Some(creds) => store.insert(host, creds),
                None => debug!(host, "auth entry has no usable credentials"),
            }
        }
        Ok(store)
    }

    /// Loads `path`; a missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(data) => Self::from_json(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no credentials file");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `$DOCKER_CONFIG/config.json`, else `~/.docker/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
    }

    /// Loads from [`Self::default_path`], falling back to an empty store.
    pub fn load_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        Self::load(&path).unwrap_or_else(|e| {
            warn!(path = %path.display(), "ignoring unreadable credentials: {}", e);
            Self::default()
        })
    }

    /// Stores credentials for `host`.
    pub fn insert(&mut self, host: &str, creds: Credentials) {
        self.entries.insert(normalize_host(host), creds);
    }

    /// Finds credentials for `host`.
    pub fn lookup(&self, host: &str) -> Option<Credentials> {
        self.entries.get(&normalize_host(host)).cloned()
    }

    /// Number of hosts with credentials.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no host has credentials.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
