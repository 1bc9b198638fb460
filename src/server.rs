//! Request handlers exposed to the viewer. The transport is a local function
//! call; both ends live in one process, so "IPC" here is the trait boundary
//! the viewer fetches through.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use crate::cache::{CacheStore, DEFAULT_CACHE_ROOT};
use crate::codec;
use crate::error::{ChunkError, Result};
use crate::preprocess::{self, PreprocessOptions, DEFAULT_CHUNK_SIZE};
use crate::types::ImageMetadata;
use crate::viewer::manager::ChunkTransport;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub cache_root: PathBuf,
    pub chunk_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Rolling counters for the request surface, in the spirit of a tile
/// server's per-interval metrics line. `take()` snapshots and resets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServeMetrics {
    pub metadata_requests: u64,
    pub cache_hits: u64,
    pub preprocess_runs: u64,
    pub chunks_served: u64,
    pub bytes_served: u64,
    pub errors: u64,
}

impl ServeMetrics {
    fn take(&mut self) -> ServeMetrics {
        std::mem::take(self)
    }
}

/// The backend half of the chunk pipeline. Owns no per-session state: all
/// cache state lives on disk; the lock table only serializes concurrent
/// preprocesses of the same source.
pub struct ChunkServer {
    store: CacheStore,
    chunk_size: u32,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    metrics: Mutex<ServeMetrics>,
}

impl ChunkServer {
    pub fn new(config: ServerConfig) -> Self {
        ChunkServer {
            store: CacheStore::new(config.cache_root),
            chunk_size: config.chunk_size,
            locks: Mutex::new(HashMap::new()),
            metrics: Mutex::new(ServeMetrics::default()),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Return this source's metadata, preprocessing on a cache miss.
    pub fn process_source(&self, path: &str) -> Result<ImageMetadata> {
        self.process_inner(path, false)
    }

    /// Rewrite the cache entry unconditionally, then return the metadata.
    pub fn force_preprocess(&self, path: &str) -> Result<ImageMetadata> {
        self.process_inner(path, true)
    }

    fn process_inner(&self, path: &str, force: bool) -> Result<ImageMetadata> {
        let result = self.try_process(path, force);
        let mut metrics = self.metrics.lock().unwrap();
        metrics.metadata_requests += 1;
        match &result {
            Ok(_) => {}
            Err(e) => {
                metrics.errors += 1;
                drop(metrics);
                warn!("process_source failed path={} kind={} err={}", path, e.kind(), e);
            }
        }
        result
    }

    fn try_process(&self, path: &str, force: bool) -> Result<ImageMetadata> {
        // The extension gate runs before anything touches the cache, so an
        // unsupported source cannot create directories as a side effect.
        codec::check_extension(Path::new(path))?;
        let source = self.resolve(path)?;

        let lock = self.source_lock(&source);
        let _guard = lock.lock().unwrap();

        let was_complete = self.store.is_complete(&source);
        let metadata = preprocess::preprocess(
            &self.store,
            &source,
            &PreprocessOptions {
                chunk_size: self.chunk_size,
                force,
            },
        )?;

        let mut metrics = self.metrics.lock().unwrap();
        if was_complete && !force {
            metrics.cache_hits += 1;
        } else {
            metrics.preprocess_runs += 1;
        }
        Ok(metadata)
    }

    /// Return the raw bytes of one chunk blob. Framing is not validated
    /// here; the viewer checks the header against the body on its side of
    /// the boundary.
    pub fn get_chunk(&self, path: &str, cx: u32, cy: u32) -> Result<Vec<u8>> {
        let start = Instant::now();
        let result = self.try_get_chunk(path, cx, cy);
        match &result {
            Ok(bytes) => {
                let mut metrics = self.metrics.lock().unwrap();
                metrics.chunks_served += 1;
                metrics.bytes_served += bytes.len() as u64;
                drop(metrics);
                info!(
                    "chunk served path={} cx={} cy={} bytes={} elapsed_ms={}",
                    path,
                    cx,
                    cy,
                    bytes.len(),
                    start.elapsed().as_millis()
                );
            }
            Err(e) => {
                self.metrics.lock().unwrap().errors += 1;
                warn!(
                    "get_chunk failed path={} cx={} cy={} kind={} err={}",
                    path,
                    cx,
                    cy,
                    e.kind(),
                    e
                );
            }
        }
        result
    }

    fn try_get_chunk(&self, path: &str, cx: u32, cy: u32) -> Result<Vec<u8>> {
        let source = self.resolve(path)?;
        // Chunk requests never trigger preprocessing; that keeps per-chunk
        // latency bounded and failure modes predictable.
        if !self.store.is_complete(&source) {
            return Err(ChunkError::NotPreprocessed { path: source });
        }
        Ok(fs::read(self.store.chunk_path(&source, cx, cy))?)
    }

    /// Remove the whole cache root.
    pub fn clear_cache(&self) -> Result<()> {
        self.store.clear_all()?;
        info!("cache cleared root={}", self.store.root().display());
        Ok(())
    }

    /// Snapshot and reset the rolling counters.
    pub fn take_metrics(&self) -> ServeMetrics {
        self.metrics.lock().unwrap().take()
    }

    /// Canonicalize the incoming path so cache identity is stable across
    /// spellings of the same file.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let path = Path::new(path);
        if !path.exists() {
            return Err(ChunkError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Ok(fs::canonicalize(path)?)
    }

    fn source_lock(&self, source: &Path) -> Arc<Mutex<()>> {
        let key = CacheStore::digest(source);
        self.locks
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl ChunkTransport for ChunkServer {
    fn fetch_chunk(&self, path: &str, cx: u32, cy: u32) -> Result<Vec<u8>> {
        self.get_chunk(path, cx, cy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob;

    fn server_with_source(width: u32, height: u32) -> (tempfile::TempDir, ChunkServer, String) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.png");
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([x as u8, y as u8, 7, 255])
        });
        img.save(&source).unwrap();

        let server = ChunkServer::new(ServerConfig {
            cache_root: dir.path().join("chunk_cache"),
            chunk_size: 32,
        });
        let path = source.to_string_lossy().into_owned();
        (dir, server, path)
    }

    #[test]
    fn get_chunk_before_preprocess_is_not_preprocessed() {
        let (_dir, server, path) = server_with_source(64, 64);
        let err = server.get_chunk(&path, 0, 0).unwrap_err();
        assert_eq!(err.kind(), "not_preprocessed");
    }

    #[test]
    fn process_then_get_every_chunk() {
        let (_dir, server, path) = server_with_source(70, 50);
        let metadata = server.process_source(&path).unwrap();
        assert_eq!((metadata.chunks_x, metadata.chunks_y), (3, 2));

        for c in &metadata.chunks {
            let bytes = server.get_chunk(&path, c.cx, c.cy).unwrap();
            assert_eq!(bytes.len() as u64, blob::blob_len(c.width, c.height));
            let parsed = blob::parse_blob(&bytes).unwrap();
            assert_eq!((parsed.width, parsed.height), (c.width, c.height));
        }
    }

    #[test]
    fn missing_source_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let server = ChunkServer::new(ServerConfig {
            cache_root: dir.path().join("chunk_cache"),
            chunk_size: 32,
        });
        let err = server.process_source("/nowhere/missing.png").unwrap_err();
        assert_eq!(err.kind(), "file_not_found");
    }

    #[test]
    fn unsupported_extension_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("scene.exr");
        std::fs::write(&source, b"whatever").unwrap();
        let server = ChunkServer::new(ServerConfig {
            cache_root: dir.path().join("chunk_cache"),
            chunk_size: 32,
        });

        let err = server
            .process_source(&source.to_string_lossy())
            .unwrap_err();
        assert_eq!(err.kind(), "unsupported_format");
        assert!(!dir.path().join("chunk_cache").exists());
    }

    #[test]
    fn force_then_process_matches_double_force() {
        let (_dir, server, path) = server_with_source(70, 50);
        let a = server.force_preprocess(&path).unwrap();
        let b = server.process_source(&path).unwrap();
        let c = server.force_preprocess(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn clear_cache_invalidates_entries() {
        let (_dir, server, path) = server_with_source(64, 64);
        server.process_source(&path).unwrap();
        assert!(server.get_chunk(&path, 0, 0).is_ok());

        server.clear_cache().unwrap();
        let err = server.get_chunk(&path, 0, 0).unwrap_err();
        assert_eq!(err.kind(), "not_preprocessed");
    }

    #[test]
    fn metrics_count_the_request_mix() {
        let (_dir, server, path) = server_with_source(64, 64);
        server.process_source(&path).unwrap(); // preprocess run
        server.process_source(&path).unwrap(); // cache hit
        server.get_chunk(&path, 0, 0).unwrap();
        let _ = server.get_chunk(&path, 9, 9); // io error: no such blob

        let metrics = server.take_metrics();
        assert_eq!(metrics.metadata_requests, 2);
        assert_eq!(metrics.preprocess_runs, 1);
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.chunks_served, 1);
        assert!(metrics.bytes_served > 0);
        assert_eq!(metrics.errors, 1);

        // take() resets.
        assert_eq!(server.take_metrics(), ServeMetrics::default());
    }

    #[test]
    fn concurrent_preprocess_of_one_source_serializes() {
        let (_dir, server, path) = server_with_source(96, 96);
        let server = Arc::new(server);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let server = server.clone();
                let path = path.clone();
                std::thread::spawn(move || server.process_source(&path).unwrap())
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for pair in results.windows(2) {
            assert_eq!(pair[0], pair[1]);
        }
        assert!(server.store().is_complete(Path::new(&path)));
    }
}
