//! # Named Timeouts
//!
//! Operations look up their time budget by key instead of hard-coding it,
//! so configuration can tune them without code changes:
//!
//! ```text
//! config.toml              TimeoutRegistry             with_timeout
//! [timeouts]          ──►  "io.magiksnap.apply" ──►   tokio::time::timeout
//! "io.magiksnap.apply"     = 600s                      └─► Error::Timeout
//!     = 600000
//! ```
//!
//! Keys that were never set resolve to [`DEFAULT_TIMEOUT`].

use crate::constants::DEFAULT_TIMEOUT;
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// Map of operation keys to time budgets.
#[derive(Debug, Default)]
pub struct TimeoutRegistry {
    timeouts: RwLock<HashMap<String, Duration>>,
}

impl TimeoutRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the timeout for `key`.
    pub fn set(&self, key: impl Into<String>, timeout: Duration) {
        if let Ok(mut timeouts) = self.timeouts.write() {
            timeouts.insert(key.into(), timeout);
        }
    }

    /// Returns the timeout for `key`, or [`DEFAULT_TIMEOUT`].
    pub fn get(&self, key: &str) -> Duration {
        self.timeouts
            .read()
            .ok()
            .and_then(|t| t.get(key).copied())
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Returns every configured key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .timeouts
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Returns a copy of every configured timeout.
    pub fn all(&self) -> HashMap<String, Duration> {
        self.timeouts.read().map(|t| t.clone()).unwrap_or_default()
    }

    /// Runs `fut` bounded by the timeout for `key`.
    pub async fn with_timeout<F, T>(&self, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let duration = self.get(key);
        debug!(key, ?duration, "running with timeout");
        match tokio::time::timeout(duration, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: key.to_string(),
                duration,
            }),
        }
    }
}

static GLOBAL: Lazy<TimeoutRegistry> = Lazy::new(TimeoutRegistry::new);

/// Returns the process-wide registry.
pub fn global() -> &'static TimeoutRegistry {
    &GLOBAL
}

/// Sets a timeout in the process-wide registry.
pub fn set(key: impl Into<String>, timeout: Duration) {
    GLOBAL.set(key, timeout);
}

/// Reads a timeout from the process-wide registry.
pub fn get(key: &str) -> Duration {
    GLOBAL.get(key)
}

/// Runs `fut` bounded by the process-wide timeout for `key`.
pub async fn with_timeout<F, T>(key: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    GLOBAL.with_timeout(key, fut).await
}
