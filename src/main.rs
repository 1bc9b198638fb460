use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use chunkview::server::{ChunkServer, ServerConfig};
use chunkview::viewer::gpu::{GpuContext, WgpuUploader};
use chunkview::viewer::{ChunkManager, HeadlessUploader, DEFAULT_FETCH_SLOTS};
use chunkview::{CacheStore, DEFAULT_CHUNK_SIZE};

#[derive(Parser, Debug)]
#[command(name = "chunkview", about = "Chunked preprocessing and progressive loading for very large raster images")]
struct Cli {
    /// Cache root directory
    #[arg(long, default_value = chunkview::cache::DEFAULT_CACHE_ROOT, global = true)]
    cache_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a source and materialize its chunk cache entry
    Preprocess(PreprocessArgs),
    /// Report cache completeness and the persisted grid for a source
    Info(InfoArgs),
    /// Drive the full viewer pipeline: preprocess, then load every chunk in
    /// spatial batches
    Load(LoadArgs),
    /// Remove the cache root
    ClearCache,
}

#[derive(Args, Debug)]
struct PreprocessArgs {
    /// Path to the source image (png, jpg, jpeg, bmp, tiff, webp)
    #[arg(long)]
    source: PathBuf,

    /// Nominal chunk edge length in pixels
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u32,

    /// Rewrite the cache entry even if a complete one exists
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct InfoArgs {
    #[arg(long)]
    source: PathBuf,
}

#[derive(Args, Debug)]
struct LoadArgs {
    #[arg(long)]
    source: PathBuf,

    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u32,

    /// Number of in-flight chunk fetches
    #[arg(long, default_value_t = DEFAULT_FETCH_SLOTS)]
    fetch_slots: usize,

    /// Upload chunks to a real GPU device instead of the headless counter
    #[arg(long)]
    gpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Preprocess(args) => run_preprocess(cli.cache_root, args),
        Command::Info(args) => run_info(cli.cache_root, args),
        Command::Load(args) => run_load(cli.cache_root, args),
        Command::ClearCache => run_clear_cache(cli.cache_root),
    }
}

fn server(cache_root: PathBuf, chunk_size: u32) -> ChunkServer {
    ChunkServer::new(ServerConfig {
        cache_root,
        chunk_size,
    })
}

fn run_preprocess(cache_root: PathBuf, args: PreprocessArgs) -> Result<()> {
    let server = server(cache_root, args.chunk_size);
    let path = args.source.to_string_lossy();
    let metadata = if args.force {
        server.force_preprocess(&path)
    } else {
        server.process_source(&path)
    }
    .with_context(|| format!("preprocess of {} failed", args.source.display()))?;

    println!(
        "{}: {}x{} px, {}x{} chunks of {} px ({} blobs)",
        args.source.display(),
        metadata.total_width,
        metadata.total_height,
        metadata.chunks_x,
        metadata.chunks_y,
        metadata.chunk_size,
        metadata.chunk_count()
    );
    Ok(())
}

fn run_info(cache_root: PathBuf, args: InfoArgs) -> Result<()> {
    let store = CacheStore::new(cache_root);
    let source = std::fs::canonicalize(&args.source)
        .with_context(|| format!("cannot resolve {}", args.source.display()))?;

    if !store.is_complete(&source) {
        println!("{}: no complete cache entry", source.display());
        return Ok(());
    }

    let metadata = store.read_metadata(&source)?;
    println!(
        "{}: complete entry at {} ({}x{} px, {} chunks of {} px)",
        source.display(),
        store.entry_dir(&source).display(),
        metadata.total_width,
        metadata.total_height,
        metadata.chunk_count(),
        metadata.chunk_size
    );
    Ok(())
}

fn run_load(cache_root: PathBuf, args: LoadArgs) -> Result<()> {
    let server = Arc::new(server(cache_root, args.chunk_size));
    let path = args.source.to_string_lossy().into_owned();

    let metadata = server
        .process_source(&path)
        .with_context(|| format!("preprocess of {} failed", args.source.display()))?;

    let start = Instant::now();
    let stats = if args.gpu {
        let ctx = GpuContext::new_headless().context("GPU context init failed")?;
        let mut manager =
            ChunkManager::new(server.clone(), WgpuUploader::new(ctx), args.fetch_slots);
        manager.initialize(&path, metadata)?;
        manager.set_on_ready(|cx, cy| info!("chunk ready cx={} cy={}", cx, cy));
        manager.run_batches();
        manager.status_stats()
    } else {
        let mut manager =
            ChunkManager::new(server.clone(), HeadlessUploader::new(), args.fetch_slots);
        manager.initialize(&path, metadata)?;
        manager.set_on_ready(|cx, cy| info!("chunk ready cx={} cy={}", cx, cy));
        manager.run_batches();
        manager.status_stats()
    };

    let metrics = server.take_metrics();
    println!(
        "loaded {} chunks ({} failed) in {} ms; served {} blobs / {} bytes",
        stats.in_gpu,
        stats.failed,
        start.elapsed().as_millis(),
        metrics.chunks_served,
        metrics.bytes_served
    );
    Ok(())
}

fn run_clear_cache(cache_root: PathBuf) -> Result<()> {
    let store = CacheStore::new(cache_root);
    store.clear_all()?;
    println!("cache cleared: {}", store.root().display());
    Ok(())
}
