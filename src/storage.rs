//! # Content-Addressed Blob Storage
//!
//! Stores layer blobs and other content by cryptographic digest, with
//! per-blob labels and streaming ingest.
//!
//! ## Storage Model
//!
//! ```text
//! ~/.magiksnap/content/
//! ├── blobs/
//! │   └── sha256/
//! │       └── ab/
//! │           └── abcd1234...        (blob content)
//! ├── metadata/
//! │   └── sha256/
//! │       └── ab/
//! │           └── abcd1234....json   (created/updated, labels)
//! └── ingest/
//!     └── <sha256(ref)>/
//!         ├── ref                    (ingest reference)
//!         └── data                   (partial content)
//! ```
//!
//! The first two hex characters form a "shard" directory to prevent
//! filesystem performance degradation with many files.
//!
//! ## Digest Verification
//!
//! Content is never stored under a digest it does not hash to. Both
//! [`BlobStore::put_blob`] and [`ContentWriter::commit`] compute sha256 over
//! the bytes and refuse mismatches.
//!
//! ## Ingest Locking
//!
//! A [`ContentWriter`] claims its reference by creating the ingest
//! directory. A second writer for the same reference fails with
//! [`Error::ContentLocked`] until the first commits or is dropped. An ingest
//! left behind by a crash is cleared with [`BlobStore::abort`].
//!
//! ## Labels
//!
//! Labels are small string maps stored beside each blob. The differ records
//! the uncompressed digest of a compressed layer as
//! [`LABEL_UNCOMPRESSED`](crate::constants::LABEL_UNCOMPRESSED), which is
//! how a later apply learns a layer's diff ID without decompressing it.
//!
//! ## Garbage Collection
//!
//! [`BlobStore::gc`] removes blobs not in the caller's referenced set.
//! GC is not safe during concurrent ingests.

use crate::constants::{BLOB_STORE_DIR, CONTENT_DIR, DEFAULT_ROOT_DIR, INGEST_DIR, METADATA_DIR};
use crate::digest::{Digest, DigestWriter};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Metadata for a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    /// Blob digest.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// When the blob was committed.
    pub created_at: DateTime<Utc>,
    /// When the labels last changed.
    pub updated_at: DateTime<Utc>,
    /// Labels.
    pub labels: HashMap<String, String>,
}

/// On-disk sidecar for a blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlobMetadata {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

impl BlobMetadata {
    fn now() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            labels: HashMap::new(),
        }
    }
}

/// Content-addressed blob store.
///
/// Cheap to clone: the store is a directory handle and every operation goes
/// to the filesystem. Writes are atomic (temp file + rename), so concurrent
/// writers of the same blob cannot corrupt it.
#[derive(Debug, Clone)]
pub struct BlobStore {
    /// Base directory for content storage.
    base_dir: PathBuf,
}

impl BlobStore {
    /// Creates a blob store at the default location.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_path())
    }

    /// Creates a blob store at the specified path.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        for dir in [BLOB_STORE_DIR, METADATA_DIR, INGEST_DIR] {
            fs::create_dir_all(base_dir.join(dir)).map_err(|e| Error::StorageInitFailed {
                path: base_dir.clone(),
                reason: e.to_string(),
            })?;
        }

        info!("Content store initialized at: {}", base_dir.display());

        Ok(Self { base_dir })
    }

    /// Returns the default storage path.
    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(DEFAULT_ROOT_DIR)
            .join(CONTENT_DIR)
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the on-disk path of a blob.
    ///
    /// [`Digest`] only admits known algorithms and lower-case hex, so the
    /// resulting path cannot escape the store.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.sharded(BLOB_STORE_DIR, digest, "")
    }

    fn metadata_path(&self, digest: &Digest) -> PathBuf {
        self.sharded(METADATA_DIR, digest, ".json")
    }

    fn sharded(&self, dir: &str, digest: &Digest, suffix: &str) -> PathBuf {
        let hex = digest.hex();
        self.base_dir
            .join(dir)
            .join(digest.algorithm())
            .join(&hex[..2])
            .join(format!("{}{}", hex, suffix))
    }

    /// Checks if a blob exists.
    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Reads a whole blob into memory.
    pub fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        fs::read(self.blob_path(digest)).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Opens a blob for streaming reads.
    pub fn open_blob(&self, digest: &Digest) -> Result<File> {
        File::open(self.blob_path(digest)).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Stores a blob after verifying its content matches the digest.
    ///
    /// Only sha256 digests are accepted so that every stored blob has been
    /// verified. Storing an existing blob is a no-op.
    pub fn put_blob(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        if digest.algorithm() != "sha256" {
            return Err(Error::StorageWriteFailed(format!(
                "unsupported digest algorithm '{}': only sha256 is supported",
                digest.algorithm()
            )));
        }

        let computed = Digest::from_bytes(data);
        if &computed != digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual: computed.to_string(),
            });
        }

        let path = self.blob_path(digest);
        if path.exists() {
            debug!("Blob {} already exists", digest);
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        // Unique temp name per writer; the rename is atomic and identical
        // content makes the last writer's win harmless.
        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp_path, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWriteFailed(e.to_string())
        })?;
        self.write_metadata(digest, &BlobMetadata::now())?;

        debug!("Stored blob {} ({} bytes, verified)", digest, data.len());
        Ok(())
    }

    /// Opens a streaming writer for `reference`.
    ///
    /// When `expected` is set, commit fails unless the written content
    /// hashes to it.
    pub fn writer(&self, reference: &str, expected: Option<Digest>) -> Result<ContentWriter> {
        crate::constants::validate_key(reference)?;
        let ingest_dir = self.ingest_path(reference);

        match fs::create_dir(&ingest_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::ContentLocked {
                    reference: reference.to_string(),
                });
            }
            Err(e) => return Err(Error::StorageWriteFailed(e.to_string())),
        }

        let open = || -> io::Result<File> {
            fs::write(ingest_dir.join("ref"), reference)?;
            File::create(ingest_dir.join("data"))
        };
        let file = match open() {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_dir_all(&ingest_dir);
                return Err(Error::StorageWriteFailed(e.to_string()));
            }
        };

        debug!(reference, "opened content writer");
        Ok(ContentWriter {
            store: self.clone(),
            reference: reference.to_string(),
            ingest_dir,
            expected,
            inner: Some(DigestWriter::new(BufWriter::new(file))),
        })
    }

    fn ingest_path(&self, reference: &str) -> PathBuf {
        self.base_dir
            .join(INGEST_DIR)
            .join(Digest::from_bytes(reference.as_bytes()).hex())
    }

    /// Lists references of ingests that are open or were abandoned.
    pub fn list_ingests(&self) -> Result<Vec<String>> {
        let mut refs = Vec::new();
        for entry in fs::read_dir(self.base_dir.join(INGEST_DIR))? {
            let entry = entry?;
            if let Ok(reference) = fs::read_to_string(entry.path().join("ref")) {
                refs.push(reference);
            }
        }
        refs.sort();
        Ok(refs)
    }

    /// Discards an ingest, releasing its lock.
    pub fn abort(&self, reference: &str) -> Result<()> {
        let dir = self.ingest_path(reference);
        if !dir.exists() {
            return Err(Error::BlobNotFound {
                digest: format!("ingest {}", reference),
            });
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    /// Returns metadata for a blob.
    pub fn info(&self, digest: &Digest) -> Result<Info> {
        let meta = fs::metadata(self.blob_path(digest)).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })?;
        let sidecar = self.read_metadata(digest).unwrap_or_else(|| {
            let modified: DateTime<Utc> = meta
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            BlobMetadata {
                created_at: modified,
                updated_at: modified,
                labels: HashMap::new(),
            }
        });
        Ok(Info {
            digest: digest.clone(),
            size: meta.len(),
            created_at: sidecar.created_at,
            updated_at: sidecar.updated_at,
            labels: sidecar.labels,
        })
    }

    /// Merges `labels` into a blob's labels. An empty value removes the key.
    pub fn update_labels(&self, digest: &Digest, labels: HashMap<String, String>) -> Result<Info> {
        if !self.has_blob(digest) {
            return Err(Error::BlobNotFound {
                digest: digest.to_string(),
            });
        }
        let mut sidecar = self.read_metadata(digest).unwrap_or_else(BlobMetadata::now);
        merge_labels(&mut sidecar.labels, labels);
        sidecar.updated_at = Utc::now();
        self.write_metadata(digest, &sidecar)?;
        self.info(digest)
    }

    fn read_metadata(&self, digest: &Digest) -> Option<BlobMetadata> {
        let raw = fs::read(self.metadata_path(digest)).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("Ignoring corrupt metadata for {}: {}", digest, e);
                None
            }
        }
    }

    fn write_metadata(&self, digest: &Digest, meta: &BlobMetadata) -> Result<()> {
        let path = self.metadata_path(digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }
        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp_path, serde_json::to_vec(meta)?)
            .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWriteFailed(e.to_string())
        })
    }

    /// Removes a blob and its metadata.
    pub fn remove_blob(&self, digest: &Digest) -> Result<()> {
        let path = self.blob_path(digest);
        if !path.exists() {
            return Err(Error::BlobNotFound {
                digest: digest.to_string(),
            });
        }
        fs::remove_file(&path).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        let _ = fs::remove_file(self.metadata_path(digest));
        Ok(())
    }

    /// Returns the total size of all blobs.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;
        Self::walk_dir(&self.base_dir.join(BLOB_STORE_DIR), &mut |path| {
            if let Ok(meta) = fs::metadata(path)
                && meta.is_file()
            {
                total += meta.len();
            }
        })?;
        Ok(total)
    }

    /// Lists all blob digests, sorted.
    pub fn list_blobs(&self) -> Result<Vec<Digest>> {
        let mut digests = Vec::new();
        let blobs = self.base_dir.join(BLOB_STORE_DIR);

        for algo in ["sha256", "sha384", "sha512"] {
            Self::walk_dir(&blobs.join(algo), &mut |path| {
                // Temp files carry an extension and fail to parse.
                if let Some(hex) = path.file_name().and_then(|n| n.to_str())
                    && let Ok(digest) = Digest::parse(&format!("{}:{}", algo, hex))
                {
                    digests.push(digest);
                }
            })?;
        }

        digests.sort();
        Ok(digests)
    }

    /// Returns metadata for every blob.
    pub fn list_infos(&self) -> Result<Vec<Info>> {
        self.list_blobs()?.iter().map(|d| self.info(d)).collect()
    }

    /// Walks a directory recursively.
    fn walk_dir(dir: &Path, callback: &mut impl FnMut(&Path)) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(dir).map_err(|e| Error::StorageWriteFailed(e.to_string()))? {
            let entry = entry.map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
            let path = entry.path();

            if path.is_dir() {
                Self::walk_dir(&path, callback)?;
            } else {
                callback(&path);
            }
        }

        Ok(())
    }

    /// Garbage collects unreferenced blobs.
    pub fn gc(&self, referenced: &[Digest]) -> Result<GcStats> {
        let mut removed = 0u64;
        let mut freed = 0u64;

        for digest in self.list_blobs()? {
            if referenced.contains(&digest) {
                continue;
            }
            let path = self.blob_path(&digest);
            if let Ok(meta) = fs::metadata(&path)
                && fs::remove_file(&path).is_ok()
            {
                freed += meta.len();
                removed += 1;
                let _ = fs::remove_file(self.metadata_path(&digest));
            }
        }

        info!("GC: removed {} blobs, freed {} bytes", removed, freed);
        Ok(GcStats {
            removed_count: removed,
            freed_bytes: freed,
        })
    }
}

fn merge_labels(target: &mut HashMap<String, String>, labels: HashMap<String, String>) {
    for (k, v) in labels {
        if v.is_empty() {
            target.remove(&k);
        } else {
            target.insert(k, v);
        }
    }
}

/// Statistics from a garbage collection run.
#[derive(Debug, Clone)]
pub struct GcStats {
    /// Number of blobs removed.
    pub removed_count: u64,
    /// Bytes freed.
    pub freed_bytes: u64,
}

// =============================================================================
// Content Writer
// =============================================================================

/// Streaming writer into the content store.
///
/// Bytes are hashed as they are written. Nothing becomes visible in the
/// store until [`ContentWriter::commit`]; dropping an uncommitted writer
/// discards the ingest.
pub struct ContentWriter {
    store: BlobStore,
    reference: String,
    ingest_dir: PathBuf,
    expected: Option<Digest>,
    inner: Option<DigestWriter<BufWriter<File>>>,
}

impl ContentWriter {
    /// Ingest reference this writer holds.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.inner.as_ref().map_or(0, DigestWriter::size)
    }

    /// Digest of the bytes written so far.
    pub fn digest(&self) -> Digest {
        self.inner
            .as_ref()
            .map_or_else(|| Digest::from_bytes(b""), DigestWriter::digest)
    }

    /// Verifies and publishes the written content.
    ///
    /// Committing content that is already present succeeds and merges the
    /// labels into the existing blob.
    pub fn commit(mut self, expected_size: Option<u64>, labels: HashMap<String, String>) -> Result<Info> {
        let writer = self
            .inner
            .take()
            .ok_or_else(|| Error::Internal("content writer already committed".to_string()))?;
        let size = writer.size();
        let digest = writer.digest();

        let mut buffered = writer.into_inner();
        buffered
            .flush()
            .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        let file = buffered
            .into_inner()
            .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        file.sync_all()
            .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        drop(file);

        if let Some(expected) = expected_size
            && expected != size
        {
            return Err(Error::SizeMismatch {
                expected,
                actual: size,
            });
        }
        if let Some(expected) = &self.expected
            && expected != &digest
        {
            return Err(Error::DigestMismatch {
                expected: expected.to_string(),
                actual: digest.to_string(),
            });
        }

        let target = self.store.blob_path(&digest);
        if target.exists() {
            debug!("Blob {} already exists, discarding ingest {}", digest, self.reference);
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
            }
            fs::rename(self.ingest_dir.join("data"), &target)
                .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
            self.store.write_metadata(&digest, &BlobMetadata::now())?;
            debug!("Committed blob {} ({} bytes) from {}", digest, size, self.reference);
        }

        if labels.is_empty() {
            self.store.info(&digest)
        } else {
            self.store.update_labels(&digest, labels)
        }
    }
}

impl Write for ContentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(w) => w.write(buf),
            None => Err(io::Error::other("content writer already committed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ContentWriter {
    fn drop(&mut self) {
        // Release the file handle before removing the directory.
        self.inner.take();
        if let Err(e) = fs::remove_dir_all(&self.ingest_dir)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("Failed to clean ingest {}: {}", self.reference, e);
        }
    }
}
