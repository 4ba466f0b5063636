//! # Configuration
//!
//! Settings are layered, later sources overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. An optional TOML file (`--config`)
//! 3. Environment variables prefixed with `MAGIKSNAP_` (e.g.
//!    `MAGIKSNAP_ROOT`, `MAGIKSNAP_LOG_LEVEL`)
//!
//! ## Example
//!
//! ```toml
//! root = "/var/lib/magiksnap"
//! log_level = "debug"
//! diff_media_type = "application/vnd.oci.image.layer.v1.tar+zstd"
//!
//! [timeouts]
//! "io.magiksnap.apply" = 900000
//! ```

use crate::constants::{
    APPLY_TIMEOUT_KEY, CONTENT_DIR, DEFAULT_ROOT_DIR, DIFF_TIMEOUT_KEY, SHUTDOWN_TIMEOUT_KEY,
    SNAPSHOT_DIR,
};
use crate::error::{Error, Result};
use crate::mediatype;
use crate::timeout::TimeoutRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const DEFAULTS: &str = r#"
log_level = "info"
diff_media_type = "application/vnd.oci.image.layer.v1.tar+gzip"

[timeouts]
"io.magiksnap.apply" = 600000
"io.magiksnap.diff" = 600000
"io.magiksnap.shutdown" = 10000
"#;

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Base directory for all state.
    pub root: PathBuf,
    /// Content store directory; defaults to `<root>/content`.
    #[serde(default)]
    pub content_dir: Option<PathBuf>,
    /// Snapshotter directory; defaults to `<root>/snapshots`.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
    /// Tracing filter directive.
    pub log_level: String,
    /// Media type used when creating diffs.
    pub diff_media_type: String,
    /// Operation timeouts in milliseconds.
    #[serde(default)]
    pub timeouts: HashMap<String, u64>,
}

impl Default for Config {
    fn default() -> Self {
        let timeouts = [
            (APPLY_TIMEOUT_KEY, 600_000),
            (DIFF_TIMEOUT_KEY, 600_000),
            (SHUTDOWN_TIMEOUT_KEY, 10_000),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            root: default_root(),
            content_dir: None,
            snapshot_dir: None,
            log_level: "info".to_string(),
            diff_media_type: mediatype::OCI_LAYER_GZIP.to_string(),
            timeouts,
        }
    }
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_ROOT_DIR)
}

impl Config {
    /// Loads defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Self::base_builder()?;
        if let Some(path) = path {
            debug!(path = %path.display(), "loading config file");
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder = builder.add_source(config::Environment::with_prefix("MAGIKSNAP"));
        Self::finish(builder)
    }

    /// Loads defaults overlaid with a TOML document. The environment is not
    /// consulted.
    pub fn from_toml(toml: &str) -> Result<Self> {
        let builder = Self::base_builder()?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml));
        Self::finish(builder)
    }

    fn base_builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        config::Config::builder()
            .add_source(config::File::from_str(DEFAULTS, config::FileFormat::Toml))
            .set_default("root", default_root().to_string_lossy().into_owned())
            .map_err(|e| Error::Config(e.to_string()))
    }

    fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(Error::Config("root must not be empty".to_string()));
        }
        if !mediatype::is_layer(&self.diff_media_type) {
            return Err(Error::Config(format!(
                "diff_media_type '{}' is not a layer type",
                self.diff_media_type
            )));
        }
        mediatype::diff_compression(&self.diff_media_type)
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }

    /// Content store directory.
    pub fn content_root(&self) -> PathBuf {
        self.content_dir
            .clone()
            .unwrap_or_else(|| self.root.join(CONTENT_DIR))
    }

    /// Snapshotter directory.
    pub fn snapshot_root(&self) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| self.root.join(SNAPSHOT_DIR))
    }

    /// Loads the configured timeouts into `registry`.
    pub fn apply_timeouts(&self, registry: &TimeoutRegistry) {
        for (key, ms) in &self.timeouts {
            registry.set(key.clone(), Duration::from_millis(*ms));
        }
    }
}
