//! # Media Types
//!
//! Recognizes OCI and Docker schema2 media types and maps layer types to
//! the compression the differ has to undo.
//!
//! A media type is a base type plus optional `+suffix` parts:
//!
//! ```text
//! application/vnd.oci.image.layer.v1.tar+gzip
//! └──────────── base ─────────────────┘ └ext┘
//! ```
//!
//! Docker layer types encode compression in the base (`.tar.gzip`) and any
//! `+suffix` means the content is wrapped in something this crate does not
//! decode. Docker's uncompressed layer type was historically used for gzip
//! data too, so it maps to [`Compression::Unknown`] and the applier sniffs
//! the stream instead of trusting the label.

use crate::error::{Error, Result};
use std::fmt;

// =============================================================================
// OCI Media Types
// =============================================================================

/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// OCI image config.
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Uncompressed OCI layer.
pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

/// Gzip-compressed OCI layer.
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Zstd-compressed OCI layer.
pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

/// Uncompressed non-distributable OCI layer.
pub const OCI_LAYER_NON_DISTRIBUTABLE: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar";

/// Gzip-compressed non-distributable OCI layer.
pub const OCI_LAYER_NON_DISTRIBUTABLE_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

/// Zstd-compressed non-distributable OCI layer.
pub const OCI_LAYER_NON_DISTRIBUTABLE_ZSTD: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd";

// =============================================================================
// Docker Schema2 Media Types
// =============================================================================

/// Docker manifest list.
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker schema2 manifest.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Docker container config.
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// Docker layer (uncompressed by name, often gzip in practice).
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// Docker gzip layer.
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Docker zstd layer.
pub const DOCKER_LAYER_ZSTD: &str = "application/vnd.docker.image.rootfs.diff.tar.zstd";

/// Docker foreign layer.
pub const DOCKER_LAYER_FOREIGN: &str = "application/vnd.docker.image.rootfs.foreign.diff.tar";

/// Docker gzip foreign layer.
pub const DOCKER_LAYER_FOREIGN_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

// =============================================================================
// Compression
// =============================================================================

/// Layer compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Plain tar.
    Uncompressed,
    /// Gzip.
    Gzip,
    /// Zstandard.
    Zstd,
    /// Media type does not say; detect from the stream.
    Unknown,
}

impl Compression {
    /// Detects compression from the leading bytes of a stream.
    ///
    /// Anything that is neither gzip nor zstd is treated as plain tar.
    pub fn detect(prefix: &[u8]) -> Self {
        match prefix {
            [0x1f, 0x8b, ..] => Self::Gzip,
            [0x28, 0xb5, 0x2f, 0xfd, ..] => Self::Zstd,
            _ => Self::Uncompressed,
        }
    }

    /// Parses a user-facing compression name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "" | "none" | "uncompressed" => Ok(Self::Uncompressed),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => Err(Error::UnsupportedMediaType(format!(
                "unknown compression '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uncompressed => "uncompressed",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Splits a media type into its base and its sorted `+` suffixes.
pub fn parse(media_type: &str) -> (&str, Vec<&str>) {
    if media_type.is_empty() {
        return ("", Vec::new());
    }
    let mut parts = media_type.split('+');
    let base = parts.next().unwrap_or_default();
    let mut ext: Vec<&str> = parts.collect();
    ext.sort_unstable();
    (base, ext)
}

/// Returns the compression a layer media type implies.
///
/// Non-layer types, and OCI layers with an unrecognised suffix, fail with
/// [`Error::UnsupportedMediaType`].
pub fn diff_compression(media_type: &str) -> Result<Compression> {
    let (base, ext) = parse(media_type);
    let wrapped = !ext.is_empty();

    match base {
        // Wrapped docker layers are handed through as-is.
        DOCKER_LAYER | DOCKER_LAYER_FOREIGN | DOCKER_LAYER_GZIP | DOCKER_LAYER_FOREIGN_GZIP
        | DOCKER_LAYER_ZSTD
            if wrapped =>
        {
            Ok(Compression::Uncompressed)
        }
        DOCKER_LAYER | DOCKER_LAYER_FOREIGN => Ok(Compression::Unknown),
        DOCKER_LAYER_GZIP | DOCKER_LAYER_FOREIGN_GZIP => Ok(Compression::Gzip),
        DOCKER_LAYER_ZSTD => Ok(Compression::Zstd),
        OCI_LAYER | OCI_LAYER_NON_DISTRIBUTABLE => match ext.last() {
            Some(&"gzip") => Ok(Compression::Gzip),
            Some(&"zstd") => Ok(Compression::Zstd),
            None => Ok(Compression::Uncompressed),
            Some(other) => Err(Error::UnsupportedMediaType(format!(
                "{}: unrecognised suffix '{}'",
                media_type, other
            ))),
        },
        _ => Err(Error::UnsupportedMediaType(media_type.to_string())),
    }
}

/// Returns the OCI layer media type for `compression`.
pub fn layer_media_type(compression: Compression) -> &'static str {
    match compression {
        Compression::Gzip => OCI_LAYER_GZIP,
        Compression::Zstd => OCI_LAYER_ZSTD,
        Compression::Uncompressed | Compression::Unknown => OCI_LAYER,
    }
}

// =============================================================================
// Predicates
// =============================================================================

/// True for any OCI or Docker layer media type.
pub fn is_layer(media_type: &str) -> bool {
    let (base, _) = parse(media_type);
    matches!(
        base,
        OCI_LAYER
            | OCI_LAYER_NON_DISTRIBUTABLE
            | DOCKER_LAYER
            | DOCKER_LAYER_GZIP
            | DOCKER_LAYER_ZSTD
            | DOCKER_LAYER_FOREIGN
            | DOCKER_LAYER_FOREIGN_GZIP
    )
}

/// True for image manifests.
pub fn is_manifest(media_type: &str) -> bool {
    matches!(media_type, OCI_MANIFEST | DOCKER_MANIFEST)
}

/// True for image indexes and manifest lists.
pub fn is_index(media_type: &str) -> bool {
    matches!(media_type, OCI_INDEX | DOCKER_MANIFEST_LIST)
}

/// True for image config blobs.
pub fn is_config(media_type: &str) -> bool {
    matches!(media_type, OCI_CONFIG | DOCKER_CONFIG)
}

/// True for Docker-specific media types.
pub fn is_docker(media_type: &str) -> bool {
    media_type.starts_with("application/vnd.docker.")
}

/// True for layers that must not be pushed to other registries.
pub fn is_non_distributable(media_type: &str) -> bool {
    let (base, _) = parse(media_type);
    matches!(
        base,
        OCI_LAYER_NON_DISTRIBUTABLE | DOCKER_LAYER_FOREIGN | DOCKER_LAYER_FOREIGN_GZIP
    )
}

/// Maps a Docker media type to its OCI equivalent.
///
/// Types without an OCI counterpart are returned unchanged.
pub fn convert_docker_to_oci(media_type: &str) -> &str {
    match media_type {
        DOCKER_MANIFEST_LIST => OCI_INDEX,
        DOCKER_MANIFEST => OCI_MANIFEST,
        DOCKER_CONFIG => OCI_CONFIG,
        DOCKER_LAYER => OCI_LAYER,
        DOCKER_LAYER_GZIP => OCI_LAYER_GZIP,
        DOCKER_LAYER_ZSTD => OCI_LAYER_ZSTD,
        DOCKER_LAYER_FOREIGN => OCI_LAYER_NON_DISTRIBUTABLE,
        DOCKER_LAYER_FOREIGN_GZIP => OCI_LAYER_NON_DISTRIBUTABLE_GZIP,
        other => other,
    }
}
