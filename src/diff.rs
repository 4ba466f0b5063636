//! # Diff Service
//!
//! Moves layers between the content store and snapshots.
//!
//! ```text
//!                  apply(desc, mounts)
//!   ┌──────────┐  ─────────────────────►  ┌───────────┐
//!   │ BlobStore│                          │ snapshot  │
//!   │ (layers) │  ◄─────────────────────  │ directory │
//!   └──────────┘  compare(lower, upper)   └───────────┘
//! ```
//!
//! [`Applier::apply`] streams a stored blob through digest verification
//! and decompression into [`archive::apply`]. It returns the
//! *uncompressed* descriptor, whose digest is the layer's diff ID.
//!
//! [`Comparer::compare`] runs [`archive::write_diff`] through the requested
//! compression into a content writer. It labels the blob with its diff ID
//! and returns the *compressed* descriptor.
//!
//! Both do blocking filesystem work on the tokio blocking pool.

use crate::archive;
use crate::constants::{LABEL_UNCOMPRESSED, MAX_LAYER_SIZE};
use crate::descriptor::Descriptor;
use crate::digest::{Digest, DigestReader, DigestWriter};
use crate::error::{Error, Result};
use crate::mediatype::{self, Compression};
use crate::snapshot::mount::{self, Mount};
use crate::storage::BlobStore;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Applies a layer blob onto mounts.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Applies the blob described by `desc` and returns the uncompressed
    /// descriptor of what was applied.
    async fn apply(&self, desc: &Descriptor, mounts: &[Mount]) -> Result<Descriptor>;
}

/// Computes a layer blob from two mount sets.
#[async_trait]
pub trait Comparer: Send + Sync {
    /// Writes the changes from `lower` to `upper` into the content store.
    async fn compare(
        &self,
        lower: &[Mount],
        upper: &[Mount],
        opts: &DiffOptions,
    ) -> Result<Descriptor>;
}

/// Options for [`Comparer::compare`].
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Media type of the produced blob; selects the compression.
    pub media_type: String,
    /// Ingest reference; a unique one is generated when absent.
    pub reference: Option<String>,
    /// Extra labels for the produced blob.
    pub labels: HashMap<String, String>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            media_type: mediatype::OCI_LAYER_GZIP.to_string(),
            reference: None,
            labels: HashMap::new(),
        }
    }
}

/// Differ that walks directory trees.
#[derive(Clone)]
pub struct WalkingDiff {
    store: Arc<BlobStore>,
}

impl WalkingDiff {
    /// Creates a differ over `store`.
    pub fn new(store: Arc<BlobStore>) -> Self {
        Self { store }
    }

    /// Returns the content store.
    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }
}

#[async_trait]
impl Applier for WalkingDiff {
    async fn apply(&self, desc: &Descriptor, mounts: &[Mount]) -> Result<Descriptor> {
        let compression = mediatype::diff_compression(&desc.media_type)?;
        if desc.size > MAX_LAYER_SIZE {
            return Err(Error::SizeLimitExceeded {
                size: desc.size,
                limit: MAX_LAYER_SIZE,
            });
        }
        let root = mount::resolve_writable_dir(mounts)?;

        let store = Arc::clone(&self.store);
        let blob = desc.clone();
        let applied = tokio::task::spawn_blocking(move || {
            apply_blob(&store, &blob, compression, &root)
        })
        .await
        .map_err(|e| Error::Internal(format!("apply task failed: {}", e)))?
        .map_err(|e| match e {
            Error::PathTraversal { .. }
            | Error::SizeLimitExceeded { .. }
            | Error::DigestMismatch { .. }
            | Error::BlobNotFound { .. } => e,
            other => Error::LayerExtractionFailed {
                digest: desc.digest.to_string(),
                reason: other.to_string(),
            },
        })?;

        info!(
            blob = %desc.digest,
            diff_id = %applied.digest,
            size = applied.size,
            "applied layer"
        );
        Ok(applied)
    }
}

fn apply_blob(
    store: &BlobStore,
    desc: &Descriptor,
    compression: Compression,
    root: &Path,
) -> Result<Descriptor> {
    let mut buffered = BufReader::new(store.open_blob(&desc.digest)?);
    let compression = match compression {
        Compression::Unknown => Compression::detect(buffered.fill_buf()?),
        known => known,
    };
    debug!(blob = %desc.digest, %compression, root = %root.display(), "extracting layer");

    let mut compressed = DigestReader::new(buffered);
    let (diff_id, size) = {
        let decompressed: Box<dyn Read + '_> = match compression {
            Compression::Gzip => Box::new(GzDecoder::new(&mut compressed)),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(&mut compressed)?),
            Compression::Uncompressed | Compression::Unknown => Box::new(&mut compressed),
        };
        let mut uncompressed = DigestReader::new(decompressed);
        archive::apply(root, &mut uncompressed)?;
        // Trailing tar padding belongs to the diff ID.
        uncompressed.drain()?;
        (uncompressed.digest(), uncompressed.size())
    };
    compressed.drain()?;

    let actual = compressed.digest();
    if actual != desc.digest {
        return Err(Error::DigestMismatch {
            expected: desc.digest.to_string(),
            actual: actual.to_string(),
        });
    }

    Ok(Descriptor::new(mediatype::OCI_LAYER, diff_id, size))
}

#[async_trait]
impl Comparer for WalkingDiff {
    async fn compare(
        &self,
        lower: &[Mount],
        upper: &[Mount],
        opts: &DiffOptions,
    ) -> Result<Descriptor> {
        let compression = match mediatype::diff_compression(&opts.media_type)? {
            Compression::Unknown => Compression::Uncompressed,
            known => known,
        };
        let lower = mount::resolve_dir(lower)?;
        let upper = mount::resolve_dir(upper)?;
        let reference = opts
            .reference
            .clone()
            .unwrap_or_else(|| format!("diff-{}", uuid::Uuid::now_v7()));

        let store = Arc::clone(&self.store);
        let opts = opts.clone();
        tokio::task::spawn_blocking(move || -> Result<Descriptor> {
            let writer = store.writer(&reference, None)?;
            let (writer, diff_id) = match compression {
                Compression::Gzip => {
                    let (enc, diff_id) = hashed_diff(
                        &lower,
                        &upper,
                        GzEncoder::new(writer, flate2::Compression::default()),
                    )?;
                    (enc.finish()?, diff_id)
                }
                Compression::Zstd => {
                    let (enc, diff_id) =
                        hashed_diff(&lower, &upper, zstd::stream::write::Encoder::new(writer, 0)?)?;
                    (enc.finish()?, diff_id)
                }
                Compression::Uncompressed | Compression::Unknown => {
                    hashed_diff(&lower, &upper, writer)?
                }
            };

            let mut labels = opts.labels;
            labels.insert(LABEL_UNCOMPRESSED.to_string(), diff_id.to_string());
            let committed = writer.commit(None, labels)?;

            info!(
                blob = %committed.digest,
                diff_id = %diff_id,
                size = committed.size,
                "created diff"
            );
            Ok(Descriptor::new(opts.media_type, committed.digest, committed.size))
        })
        .await
        .map_err(|e| Error::Internal(format!("diff task failed: {}", e)))?
    }
}

/// Writes the diff through a hashing adapter; returns the writer and the
/// digest of the uncompressed tar.
fn hashed_diff<W: Write>(lower: &Path, upper: &Path, writer: W) -> Result<(W, Digest)> {
    let hashing = archive::write_diff(lower, upper, DigestWriter::new(writer))?;
    let diff_id = hashing.digest();
    Ok((hashing.into_inner(), diff_id))
}
