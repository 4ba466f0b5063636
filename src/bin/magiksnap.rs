//! MagikSnap - layer store and snapshot CLI
//!
//! Stores layer blobs, applies them into snapshots and computes new layers
//! from snapshots.
//!
//! ## Usage
//!
//! ```sh
//! magiksnap content put layer.tar.gz --layer
//! magiksnap apply --layer sha256:3f2a --layer sha256:9c1e
//! magiksnap snapshot ls
//! magiksnap diff <snapshot-key> --media-type application/vnd.oci.image.layer.v1.tar+zstd
//! magiksnap chainid <diff-id>...
//! ```
//!
//! Digests may be abbreviated to any unique prefix, with or without the
//! `sha256:` algorithm.

use clap::{Args, Parser, Subcommand};
use magiksnap::constants::{
    APPLY_TIMEOUT_KEY, DIFF_TIMEOUT_KEY, LABEL_SNAPSHOT_BLOB, LABEL_UNCOMPRESSED, UNPACK_KEY_PREFIX,
};
use magiksnap::digest::DigestReader;
use magiksnap::progress::{Bar, Bytes, BytesPerSecond, ProgressWriter};
use magiksnap::rootfs::{self, ApplyOptions, Layer};
use magiksnap::{
    BlobStore, Compression, Config, Descriptor, DiffOptions, Digest, Error, Kind,
    NaiveSnapshotter, Result, ShutdownService, Snapshotter, TruncIndex, WalkingDiff, mediatype,
    timeout,
};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "magiksnap", version, about = "Content-addressed layer store and snapshot tool")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, global = true, env = "MAGIKSNAP_CONFIG")]
    config: Option<PathBuf>,

    /// Override the state root directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Tracing filter, e.g. `debug` or `magiksnap=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the chain ID of a list of diff IDs.
    Chainid {
        /// Diff IDs, bottom layer first.
        #[arg(required = true)]
        diff_ids: Vec<Digest>,
        /// Print the chain ID of every prefix of the list.
        #[arg(long)]
        all: bool,
    },
    /// Manage stored content.
    #[command(subcommand)]
    Content(ContentCommand),
    /// Manage snapshots.
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Apply layers and print the resulting chain ID.
    Apply(ApplyArgs),
    /// Store the diff of a snapshot against its parent.
    Diff {
        /// Snapshot key.
        key: String,
        /// Media type of the produced layer.
        #[arg(long)]
        media_type: Option<String>,
        /// Ingest reference.
        #[arg(long = "ref")]
        reference: Option<String>,
        /// Labels for the produced blob.
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
}

#[derive(Debug, Subcommand)]
enum ContentCommand {
    /// List blobs.
    Ls,
    /// Store a file.
    Put {
        file: PathBuf,
        /// Record the uncompressed digest so the blob can be applied.
        #[arg(long)]
        layer: bool,
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Remove a blob.
    Rm { digest: String },
    /// Remove blobs no committed snapshot was built from.
    Gc,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    /// List snapshots.
    Ls,
    /// Remove a snapshot.
    Rm { key: String },
    /// Show disk usage.
    Usage { key: String },
    /// Commit an active snapshot.
    Commit { name: String, key: String },
}

#[derive(Debug, Args)]
struct ApplyArgs {
    /// Layer blob, optionally with its diff ID: `<blob>[=<diff-id>]`.
    #[arg(long = "layer", required = true, value_parser = parse_layer_arg)]
    layers: Vec<LayerArg>,
    /// Labels for the committed snapshots.
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct LayerArg {
    blob: String,
    diff_id: Option<Digest>,
}

fn parse_layer_arg(s: &str) -> std::result::Result<LayerArg, String> {
    match s.split_once('=') {
        Some((blob, diff_id)) => Ok(LayerArg {
            blob: blob.to_string(),
            diff_id: Some(diff_id.parse().map_err(|e: Error| e.to_string())?),
        }),
        None => Ok(LayerArg {
            blob: s.to_string(),
            diff_id: None,
        }),
    }
}

fn parse_label(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("label '{}' must be key=value", s))
}

// =============================================================================
// Context
// =============================================================================

struct Context {
    config: Config,
    store: Arc<BlobStore>,
    snapshotter: Arc<NaiveSnapshotter>,
    differ: WalkingDiff,
}

impl Context {
    fn open(config: Config) -> Result<Self> {
        let store = Arc::new(BlobStore::with_path(config.content_root())?);
        let snapshotter = Arc::new(NaiveSnapshotter::with_path(config.snapshot_root())?);
        let differ = WalkingDiff::new(Arc::clone(&store));
        Ok(Self {
            config,
            store,
            snapshotter,
            differ,
        })
    }

    /// Resolves a possibly abbreviated digest against stored blobs.
    fn resolve_blob(&self, prefix: &str) -> Result<Digest> {
        let prefix = if prefix.contains(':') {
            prefix.to_string()
        } else {
            format!("sha256:{}", prefix)
        };
        let index = TruncIndex::new(self.store.list_blobs()?.iter().map(Digest::to_string));
        index.get(&prefix)?.parse()
    }

    /// Resolves a snapshot key, accepting unique prefixes of keys that
    /// contain no spaces.
    async fn resolve_snapshot(&self, key: &str) -> Result<String> {
        match self.snapshotter.stat(key).await {
            Ok(info) => return Ok(info.name),
            Err(e) if !e.is_not_found() => return Err(e),
            Err(_) => {}
        }
        let index = TruncIndex::new(
            self.snapshotter
                .walk()
                .await?
                .into_iter()
                .map(|info| info.name),
        );
        index.get(key)
    }
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_chainid(diff_ids: Vec<Digest>, all: bool) -> Result<()> {
    let chain = magiksnap::chain_ids(&diff_ids);
    if all {
        for (i, id) in chain.iter().enumerate() {
            println!("{}\t{}", i, id);
        }
    } else if let Some(top) = chain.last() {
        println!("{}", top);
    }
    Ok(())
}

async fn cmd_content(ctx: &Context, cmd: ContentCommand) -> Result<()> {
    match cmd {
        ContentCommand::Ls => {
            println!("{:<71}  {:>8}  {:<20}  LABELS", "DIGEST", "SIZE", "CREATED");
            for info in ctx.store.list_infos()? {
                let mut labels: Vec<String> =
                    info.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                labels.sort();
                println!(
                    "{:<71}  {:>8}  {:<20}  {}",
                    info.digest,
                    Bytes(info.size as i64).to_string(),
                    info.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    labels.join(",")
                );
            }
            Ok(())
        }
        ContentCommand::Put {
            file,
            layer,
            labels,
        } => {
            let data = std::fs::read(&file)?;
            let digest = Digest::from_bytes(&data);
            ctx.store.put_blob(&digest, &data)?;

            let mut labels: HashMap<String, String> = labels.into_iter().collect();
            if layer && !labels.contains_key(LABEL_UNCOMPRESSED) {
                let diff_id = uncompressed_digest(&data)?;
                labels.insert(LABEL_UNCOMPRESSED.to_string(), diff_id.to_string());
            }
            if !labels.is_empty() {
                ctx.store.update_labels(&digest, labels)?;
            }
            println!("{}", digest);
            Ok(())
        }
        ContentCommand::Rm { digest } => {
            let digest = ctx.resolve_blob(&digest)?;
            ctx.store.remove_blob(&digest)?;
            println!("{}", digest);
            Ok(())
        }
        ContentCommand::Gc => {
            let mut referenced = Vec::new();
            for info in ctx.snapshotter.walk().await? {
                if let Some(blob) = info.labels.get(LABEL_SNAPSHOT_BLOB) {
                    referenced.push(blob.parse::<Digest>()?);
                }
            }
            let stats = ctx.store.gc(&referenced)?;
            println!(
                "removed {} blobs, freed {}",
                stats.removed_count,
                Bytes(stats.freed_bytes as i64)
            );
            Ok(())
        }
    }
}

/// Digest of `data` after decompression.
fn uncompressed_digest(data: &[u8]) -> Result<Digest> {
    let mut buffered = BufReader::new(data);
    let compression = Compression::detect(buffered.fill_buf()?);
    let decompressed: Box<dyn Read + '_> = match compression {
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(buffered)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(buffered)?),
        Compression::Uncompressed | Compression::Unknown => Box::new(buffered),
    };
    let mut reader = DigestReader::new(decompressed);
    reader.drain()?;
    Ok(reader.digest())
}

async fn cmd_snapshot(ctx: &Context, cmd: SnapshotCommand) -> Result<()> {
    let sn = &*ctx.snapshotter;
    match cmd {
        SnapshotCommand::Ls => {
            println!("{:<40}  {:<40}  KIND", "KEY", "PARENT");
            for info in sn.walk().await? {
                println!(
                    "{:<40}  {:<40}  {}",
                    info.name,
                    info.parent.as_deref().unwrap_or(""),
                    info.kind
                );
            }
        }
        SnapshotCommand::Rm { key } => {
            let key = ctx.resolve_snapshot(&key).await?;
            sn.remove(&key).await?;
            println!("{}", key);
        }
        SnapshotCommand::Usage { key } => {
            let key = ctx.resolve_snapshot(&key).await?;
            let usage = sn.usage(&key).await?;
            println!("{}\t{}\t{} inodes", key, Bytes(usage.size as i64), usage.inodes);
        }
        SnapshotCommand::Commit { name, key } => {
            let key = ctx.resolve_snapshot(&key).await?;
            sn.commit(&name, &key, HashMap::new()).await?;
            println!("{}", name);
        }
    }
    Ok(())
}

async fn cmd_apply(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let mut layers = Vec::with_capacity(args.layers.len());
    for arg in &args.layers {
        layers.push(resolve_layer(ctx, arg)?);
    }
    let opts = ApplyOptions {
        labels: args.labels.into_iter().collect(),
    };

    let mut progress = ProgressWriter::new(std::io::stderr());
    let started = Instant::now();
    let total: u64 = layers.iter().map(|l| l.blob.size).sum();
    let mut done = 0u64;
    let mut chain: Vec<Digest> = Vec::with_capacity(layers.len());

    for (i, layer) in layers.iter().enumerate() {
        let applied =
            rootfs::apply_layer_with_opts(layer, &chain, &*ctx.snapshotter, &ctx.differ, &opts)
                .await?;
        chain.push(layer.diff.digest.clone());
        done += layer.blob.size;

        let fraction = if total == 0 { 1.0 } else { done as f64 / total as f64 };
        let _ = writeln!(
            progress,
            "layer {}/{} {} {}",
            i + 1,
            layers.len(),
            layer.blob.digest.short(),
            if applied { "applied" } else { "exists" }
        );
        let _ = writeln!(
            progress,
            "{:40} {} / {} {}",
            Bar(fraction),
            Bytes(done as i64),
            Bytes(total as i64),
            BytesPerSecond::new(done as i64, started.elapsed())
        );
        let _ = progress.flush();
    }

    let chain_id = magiksnap::chain_id(&chain)
        .ok_or_else(|| Error::FailedPrecondition("no layers to apply".to_string()))?;
    info!(%chain_id, elapsed = ?started.elapsed(), "apply finished");
    println!("{}", chain_id);
    Ok(())
}

fn resolve_layer(ctx: &Context, arg: &LayerArg) -> Result<Layer> {
    let blob = ctx.resolve_blob(&arg.blob)?;
    let info = ctx.store.info(&blob)?;

    let diff_id = match &arg.diff_id {
        Some(diff_id) => diff_id.clone(),
        None => info
            .labels
            .get(LABEL_UNCOMPRESSED)
            .ok_or_else(|| {
                Error::FailedPrecondition(format!(
                    "blob {} has no {} label; pass <blob>=<diff-id>",
                    blob, LABEL_UNCOMPRESSED
                ))
            })?
            .parse()?,
    };

    let mut header = [0u8; 8];
    let read = ctx.store.open_blob(&blob)?.read(&mut header)?;
    let media_type = mediatype::layer_media_type(Compression::detect(&header[..read]));
    debug!(%blob, %diff_id, media_type, "resolved layer");

    Ok(Layer {
        diff: Descriptor::new(mediatype::OCI_LAYER, diff_id, 0),
        blob: Descriptor::new(media_type, blob, info.size),
    })
}

async fn cmd_diff(
    ctx: &Context,
    key: String,
    media_type: Option<String>,
    reference: Option<String>,
    labels: Vec<(String, String)>,
) -> Result<()> {
    let key = ctx.resolve_snapshot(&key).await?;
    let opts = DiffOptions {
        media_type: media_type.unwrap_or_else(|| ctx.config.diff_media_type.clone()),
        reference,
        labels: labels.into_iter().collect(),
    };
    let desc = rootfs::create_diff(&key, &*ctx.snapshotter, &ctx.differ, &opts).await?;
    println!("{}", serde_json::to_string_pretty(&desc)?);
    Ok(())
}

// =============================================================================
// Shutdown
// =============================================================================

/// Removes extraction snapshots left behind by an interrupted apply.
async fn remove_extractions(sn: Arc<NaiveSnapshotter>) -> Result<()> {
    for info in sn.walk().await? {
        if info.kind == Kind::Active && info.name.starts_with(UNPACK_KEY_PREFIX) {
            match sn.remove(&info.name).await {
                Ok(()) => info!(key = %info.name, "removed interrupted extraction"),
                Err(e) => warn!(key = %info.name, "failed to remove extraction: {}", e),
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

async fn run(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Chainid { diff_ids, all } => cmd_chainid(diff_ids, all),
        Command::Content(cmd) => cmd_content(ctx, cmd).await,
        Command::Snapshot(cmd) => cmd_snapshot(ctx, cmd).await,
        Command::Apply(args) => timeout::with_timeout(APPLY_TIMEOUT_KEY, cmd_apply(ctx, args)).await,
        Command::Diff {
            key,
            media_type,
            reference,
            labels,
        } => {
            timeout::with_timeout(
                DIFF_TIMEOUT_KEY,
                cmd_diff(ctx, key, media_type, reference, labels),
            )
            .await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(root) = cli.root {
        config.root = root;
    }

    let filter = cli.log_level.as_deref().unwrap_or(&config.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    config.apply_timeouts(timeout::global());

    let ctx = match Context::open(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = ShutdownService::new();
    let sn = Arc::clone(&ctx.snapshotter);
    shutdown.register_callback(move || remove_extractions(sn));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cleaning up");
                shutdown.shutdown().await;
            }
        });
    }

    let result = tokio::select! {
        result = run(&ctx, cli.command) => result,
        _ = shutdown.done() => Err(shutdown.err().unwrap_or(Error::Shutdown)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
