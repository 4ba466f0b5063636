//! # Rootfs Assembly
//!
//! Turns an ordered list of layers into a committed snapshot named by the
//! chain ID, and turns a snapshot back into a layer.
//!
//! ## Applying Layers
//!
//! ```text
//! layers:   L0        L1           L2
//! diff IDs: d0        d1           d2
//! chain:    c0=d0     c1=H(c0 d1)  c2=H(c1 d2)
//!
//! stat(c2)? ── exists ──► done
//!     │
//!     └─ missing ─► prepare("extract-<u> c2", parent=c1)
//!                       │
//!                       ├─ parent missing ─► apply L0..L1 first, retry once
//!                       ├─ key exists ─────► retry with a fresh key
//!                       └─ ok ─► apply L2 ─► check diff ID ─► commit(c2)
//! ```
//!
//! Re-applying is cheap and safe. An existing chain ID short-circuits, and a
//! concurrent applier that commits the same chain ID first turns this
//! caller's commit into an AlreadyExists error, which is treated as success.
//! A failed apply removes its temporary extraction snapshot.

use crate::constants::{LABEL_SNAPSHOT_BLOB, MAX_LAYERS, MAX_PREPARE_ATTEMPTS, UNPACK_KEY_PREFIX};
use crate::descriptor::Descriptor;
use crate::diff::{Applier, Comparer, DiffOptions};
use crate::digest::{self, Digest};
use crate::error::{Error, Result};
use crate::snapshot::{Kind, Snapshotter};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, warn};

/// A layer to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Uncompressed descriptor; its digest is the diff ID.
    pub diff: Descriptor,
    /// Stored (possibly compressed) blob.
    pub blob: Descriptor,
}

/// Options for applying layers.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Labels set on extraction snapshots and on the committed result.
    pub labels: HashMap<String, String>,
}

/// Applies `layers` and returns the chain ID of the result.
pub async fn apply_layers(
    layers: &[Layer],
    sn: &dyn Snapshotter,
    applier: &dyn Applier,
) -> Result<Digest> {
    apply_layers_with_opts(layers, sn, applier, &ApplyOptions::default()).await
}

/// Applies `layers` with options and returns the chain ID of the result.
pub async fn apply_layers_with_opts(
    layers: &[Layer],
    sn: &dyn Snapshotter,
    applier: &dyn Applier,
    opts: &ApplyOptions,
) -> Result<Digest> {
    if layers.len() > MAX_LAYERS {
        return Err(Error::SizeLimitExceeded {
            size: layers.len() as u64,
            limit: MAX_LAYERS as u64,
        });
    }
    let chain: Vec<Digest> = layers.iter().map(|l| l.diff.digest.clone()).collect();
    let chain_id = digest::chain_id(&chain)
        .ok_or_else(|| Error::FailedPrecondition("no layers to apply".to_string()))?;

    // Only the top is checked here; lower layers are checked by prepare,
    // which keeps them from being removed underneath us.
    match sn.stat(&chain_id.to_string()).await {
        Ok(_) => {
            debug!(%chain_id, "rootfs already present");
            return Ok(chain_id);
        }
        Err(e) if !e.is_not_found() => return Err(e),
        Err(_) => {}
    }

    match apply_chain(layers, &chain, sn, applier, opts).await {
        Ok(()) => info!(%chain_id, layers = layers.len(), "applied layers"),
        Err(e) if e.is_already_exists() => debug!(%chain_id, "rootfs committed concurrently"),
        Err(e) => return Err(e),
    }
    Ok(chain_id)
}

/// Applies one layer on top of the snapshot named by `parent_chain`.
///
/// Returns `true` only if this call applied the layer; `false` means it was
/// already present.
pub async fn apply_layer(
    layer: &Layer,
    parent_chain: &[Digest],
    sn: &dyn Snapshotter,
    applier: &dyn Applier,
) -> Result<bool> {
    apply_layer_with_opts(layer, parent_chain, sn, applier, &ApplyOptions::default()).await
}

/// [`apply_layer`] with options.
pub async fn apply_layer_with_opts(
    layer: &Layer,
    parent_chain: &[Digest],
    sn: &dyn Snapshotter,
    applier: &dyn Applier,
    opts: &ApplyOptions,
) -> Result<bool> {
    let mut chain = parent_chain.to_vec();
    chain.push(layer.diff.digest.clone());
    let chain_id = digest::chain_id(&chain)
        .ok_or_else(|| Error::Internal("empty chain".to_string()))?;

    match sn.stat(&chain_id.to_string()).await {
        Ok(_) => return Ok(false),
        Err(e) if !e.is_not_found() => return Err(e),
        Err(_) => {}
    }

    match apply_chain(std::slice::from_ref(layer), &chain, sn, applier, opts).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_already_exists() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Applies the last of `layers` as the top of `chain`, recursing into the
/// remaining layers when the parent snapshot is missing.
///
/// `layers` are the trailing entries of `chain`.
fn apply_chain<'a>(
    layers: &'a [Layer],
    chain: &'a [Digest],
    sn: &'a dyn Snapshotter,
    applier: &'a dyn Applier,
    opts: &'a ApplyOptions,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let (Some(layer), Some(chain_id)) = (layers.last(), digest::chain_id(chain)) else {
            return Err(Error::Internal("empty layer chain".to_string()));
        };
        let parent = digest::chain_id(&chain[..chain.len() - 1]).map(|d| d.to_string());
        let chain_id = chain_id.to_string();

        let mut parents_applied = false;
        let mut attempts = 0;
        let (key, mounts) = loop {
            let key = format!("{}{} {}", UNPACK_KEY_PREFIX, unique_part(), chain_id);
            match sn.prepare(&key, parent.as_deref(), opts.labels.clone()).await {
                Ok(mounts) => break (key, mounts),
                Err(e) if e.is_not_found() && layers.len() > 1 && !parents_applied => {
                    debug!(%chain_id, ?parent, "parent missing, applying lower layers");
                    let lower = layers.len() - 1;
                    if let Err(e) = apply_chain(
                        &layers[..lower],
                        &chain[..chain.len() - 1],
                        sn,
                        applier,
                        opts,
                    )
                    .await
                        && !e.is_already_exists()
                    {
                        return Err(e);
                    }
                    parents_applied = true;
                }
                Err(e) if e.is_already_exists() => {
                    attempts += 1;
                    if attempts >= MAX_PREPARE_ATTEMPTS {
                        // Must not surface as AlreadyExists, which callers
                        // read as "someone else committed the chain".
                        return Err(Error::FailedPrecondition(format!(
                            "failed to prepare extraction snapshot after {} attempts: {}",
                            attempts, e
                        )));
                    }
                    debug!(key, "extraction key taken, retrying");
                }
                Err(e) => {
                    warn!(key, "failed to prepare extraction snapshot: {}", e);
                    return Err(e);
                }
            }
        };

        let result = async {
            let diff = applier.apply(&layer.blob, &mounts).await?;
            if diff.digest != layer.diff.digest {
                return Err(Error::WrongDiffId {
                    expected: layer.diff.digest.to_string(),
                    actual: diff.digest.to_string(),
                });
            }
            let mut labels = opts.labels.clone();
            labels.insert(LABEL_SNAPSHOT_BLOB.to_string(), layer.blob.digest.to_string());
            sn.commit(&chain_id, &key, labels).await
        }
        .await;

        if let Err(e) = &result {
            if !e.is_already_exists() {
                warn!(key, layer = %layer.diff.digest, "layer apply failed: {}", e);
            }
            if let Err(rerr) = sn.remove(&key).await {
                warn!(key, "failed to clean up extraction snapshot: {}", rerr);
            }
        }
        result
    })
}

/// Computes the diff of `snapshot_key` against its parent and stores it.
///
/// Active snapshots and views are compared in place; committed snapshots
/// are compared through a temporary view.
pub async fn create_diff(
    snapshot_key: &str,
    sn: &dyn Snapshotter,
    comparer: &dyn Comparer,
    opts: &DiffOptions,
) -> Result<Descriptor> {
    let info = sn.stat(snapshot_key).await?;

    let lower_key = format!(
        "{}-parent-view-{}",
        info.parent.as_deref().unwrap_or_default(),
        unique_part()
    );
    let lower = sn
        .view(&lower_key, info.parent.as_deref(), HashMap::new())
        .await?;

    let result = async {
        let (upper, upper_key) = match info.kind {
            Kind::Active | Kind::View => (sn.mounts(snapshot_key).await?, None),
            Kind::Committed => {
                let key = format!("{}-view-{}", snapshot_key, unique_part());
                let mounts = sn.view(&key, Some(snapshot_key), HashMap::new()).await?;
                (mounts, Some(key))
            }
        };
        let desc = comparer.compare(&lower, &upper, opts).await;
        if let Some(key) = upper_key {
            remove_quietly(sn, &key).await;
        }
        desc
    }
    .await;

    remove_quietly(sn, &lower_key).await;
    result
}

async fn remove_quietly(sn: &dyn Snapshotter, key: &str) {
    if let Err(e) = sn.remove(key).await {
        warn!(key, "failed to remove temporary view: {}", e);
    }
}

fn unique_part() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}
