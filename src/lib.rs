//! # magiksnap
//!
//! **Content-Addressed Layer Store and Rootfs Snapshot Pipeline**
//!
//! This crate turns ordered chains of OCI layer blobs into committed
//! filesystem snapshots, and turns snapshots back into layer blobs. Each
//! committed snapshot is named by the ChainID of the layers beneath it, so
//! applying the same chain twice is a cheap lookup.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            magiksnap                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                     rootfs pipeline                         │    │
//! │  │   apply_layers(layers) → ChainID     create_diff(key) → blob│    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                 │                               │                   │
//! │  ┌──────────────┴──────────────┐  ┌─────────────┴──────────────┐    │
//! │  │     Snapshotter trait       │  │  Applier / Comparer traits │    │
//! │  │  prepare → commit → remove  │  │  tar + whiteouts, gzip/zstd│    │
//! │  │  NaiveSnapshotter (copies)  │  │  WalkingDiff               │    │
//! │  └─────────────────────────────┘  └─────────────┬──────────────┘    │
//! │                                                 │                   │
//! │  ┌──────────────────────────────────────────────┴──────────────┐    │
//! │  │               Content-Addressed Storage                     │    │
//! │  │  Digest verification │ Ingest locking │ Labels │ GC         │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  truncindex │ timeout │ progress │ shutdown │ credentials │ config  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Snapshot Lifecycle
//!
//! ```text
//!   prepare(key, parent)      commit(name, key)
//!  ────────────────────► Active ─────────────────► Committed
//!                          │                          │
//!                          │ remove                   │ view(key, name)
//!                          ▼                          ▼
//!                       (gone)                       View
//! ```
//!
//! # Security Model
//!
//! Layers are untrusted input:
//!
//! - **Path Traversal Protection**: Entries are sanitized component by
//!   component, and writes through symlinked parents are refused
//!   (see [`archive::apply`]).
//! - **Size Limits**: `MAX_LAYER_SIZE`, `MAX_ROOTFS_SIZE` and
//!   `MAX_FILES_PER_LAYER` bound what one layer can consume.
//! - **Digest Verification**: Blobs are verified on ingest and again while
//!   being applied; the uncompressed digest must match the expected diff ID.
//!
//! # Example
//!
//! ```rust,ignore
//! use magiksnap::{BlobStore, NaiveSnapshotter, WalkingDiff, rootfs};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> magiksnap::Result<()> {
//!     let store = Arc::new(BlobStore::new()?);
//!     let snapshotter = NaiveSnapshotter::new()?;
//!     let differ = WalkingDiff::new(store);
//!
//!     let layers: Vec<rootfs::Layer> = todo!("descriptors of stored layers");
//!     let chain_id = rootfs::apply_layers(&layers, &snapshotter, &differ).await?;
//!     println!("rootfs ready at {chain_id}");
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod descriptor;
pub mod diff;
pub mod digest;
pub mod error;
pub mod mediatype;
pub mod progress;
pub mod rootfs;
pub mod shutdown;
pub mod snapshot;
pub mod storage;
pub mod timeout;
pub mod truncindex;

// Re-exports
pub use config::Config;
pub use constants::*;
pub use credentials::{CredentialStore, Credentials};
pub use descriptor::Descriptor;
pub use diff::{Applier, Comparer, DiffOptions, WalkingDiff};
pub use digest::{Digest, chain_id, chain_ids};
pub use error::{Error, Result};
pub use mediatype::Compression;
pub use rootfs::{ApplyOptions, Layer, apply_layer, apply_layers, create_diff};
pub use shutdown::ShutdownService;
pub use snapshot::{Kind, Mount, NaiveSnapshotter, Snapshotter};
pub use storage::BlobStore;
pub use timeout::TimeoutRegistry;
pub use truncindex::TruncIndex;
