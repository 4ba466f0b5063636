//! # Pipeline Constants
//!
//! Resource limits, media types, label keys, key formats and directory
//! names for the content store, snapshotter and layer pipeline. These are
//! the **single source of truth** for bounds used across the crate.
//!
//! ## Cross-References
//!
//! - [`crate::archive`]: Uses size and entry limits for tar application
//! - [`crate::storage`]: Uses directory names and digest length rules
//! - [`crate::rootfs`]: Uses key formats and the prepare retry bound
//! - [`crate::diff`]: Uses the uncompressed label and default media type

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================
//
// These limits bound disk and memory usage when applying untrusted layers.
// MAX_ROOTFS_SIZE is the effective extraction bound; a compression bomb
// fails once the accumulated uncompressed bytes cross it.
// =============================================================================

/// Maximum size of a single compressed layer blob (512 MiB).
///
/// **Security**: Checked before a blob is decompressed so a corrupt or
/// hostile store entry cannot feed an unbounded stream into the applier.
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum total bytes written into a snapshot by one apply (4 GiB).
///
/// **Attack Vector**: Compression bombs (small compressed, huge uncompressed).
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of layers accepted by a single `apply_layers` call.
pub const MAX_LAYERS: usize = 128;

/// Maximum number of tar entries per layer.
///
/// **Attack Vector**: Inode exhaustion via millions of tiny files.
pub const MAX_FILES_PER_LAYER: usize = 100_000;

/// Maximum length of a snapshot key or content ingest reference.
pub const MAX_KEY_LEN: usize = 512;

// =============================================================================
// Retry Bounds
// =============================================================================

/// How many fresh extraction keys are tried when `prepare` reports the key
/// already exists before the apply gives up.
pub const MAX_PREPARE_ATTEMPTS: usize = 3;

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout returned by the registry for keys that were never set.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Registry key bounding a full `apply` command.
pub const APPLY_TIMEOUT_KEY: &str = "io.magiksnap.apply";

/// Registry key bounding a `diff` command.
pub const DIFF_TIMEOUT_KEY: &str = "io.magiksnap.diff";

/// Registry key bounding each shutdown callback.
pub const SHUTDOWN_TIMEOUT_KEY: &str = "io.magiksnap.shutdown";

// =============================================================================
// Storage Paths
// =============================================================================

/// Default base directory name under the user's home.
pub const DEFAULT_ROOT_DIR: &str = ".magiksnap";

/// Content store directory (relative to root).
pub const CONTENT_DIR: &str = "content";

/// Blob directory within the content store.
pub const BLOB_STORE_DIR: &str = "blobs";

/// Label sidecar directory within the content store.
pub const METADATA_DIR: &str = "metadata";

/// In-progress ingest directory within the content store.
pub const INGEST_DIR: &str = "ingest";

/// Snapshotter directory (relative to root).
pub const SNAPSHOT_DIR: &str = "snapshots";

/// Snapshotter metadata file name.
pub const SNAPSHOT_METADATA_FILE: &str = "metadata.json";

// =============================================================================
// Snapshot Keys
// =============================================================================

/// Prefix of the temporary key used while a layer is being extracted.
///
/// Full form is `extract-<unique> <chain-id>`; anything still carrying this
/// prefix after a crash is garbage and is removed on shutdown.
pub const UNPACK_KEY_PREFIX: &str = "extract-";

// =============================================================================
// Labels
// =============================================================================

/// Content label recording the uncompressed digest (diff ID) of a layer blob.
pub const LABEL_UNCOMPRESSED: &str = "magiksnap.io/uncompressed";

/// Snapshot label recording the layer blob a committed snapshot came from.
pub const LABEL_SNAPSHOT_BLOB: &str = "magiksnap.io/snapshot.blob";

// =============================================================================
// Whiteouts
// =============================================================================

/// Prefix of a whiteout entry marking a deletion from lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Prefix reserved for whiteout metadata entries.
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

/// Opaque directory marker (hides all lower-layer content of the directory).
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

// =============================================================================
// Digest Validation
// =============================================================================

/// Returns the expected hex length for a supported digest algorithm.
pub fn digest_hex_len(algorithm: &str) -> Option<usize> {
    match algorithm {
        "sha256" => Some(64),
        "sha384" => Some(96),
        "sha512" => Some(128),
        _ => None,
    }
}

/// Validates a snapshot key or ingest reference.
///
/// Keys are free-form but must be non-empty, bounded, and free of NUL and
/// newline characters so they survive the JSON metadata file and log lines.
pub fn validate_key(key: &str) -> crate::error::Result<()> {
    if key.is_empty() {
        return Err(crate::error::Error::FailedPrecondition(
            "key must not be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(crate::error::Error::FailedPrecondition(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LEN
        )));
    }
    if key.contains(['\0', '\n', '\r']) {
        return Err(crate::error::Error::FailedPrecondition(format!(
            "key contains control characters: {:?}",
            key
        )));
    }
    Ok(())
}
