//! On-disk chunk cache.
//!
//! Layout, relative to the configured cache root:
//!
//! ```text
//! <root>/
//!   <digest(path)>/
//!     metadata            # JSON ImageMetadata record
//!     chunk_0_0.bin
//!     chunk_1_0.bin
//!     ...
//! ```
//!
//! Entries are keyed by a digest of the source's canonical path, not its
//! content. Overwriting a source file without a force-preprocess leaves the
//! entry stale; that is documented user error, resolved by
//! `force_preprocess` or `clear_cache`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::blob;
use crate::error::{ChunkError, Result};
use crate::types::ImageMetadata;

/// Default cache root, relative to the working directory.
pub const DEFAULT_CACHE_ROOT: &str = "chunk_cache";

/// File name of the per-entry metadata record. Its presence marks the entry
/// as committed.
pub const METADATA_FILE: &str = "metadata";

pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// A store rooted at `root`. The directory is created lazily on the
    /// first write, never here.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CacheStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic per-source directory name.
    pub fn digest(source: &Path) -> String {
        blake3::hash(source.to_string_lossy().as_bytes())
            .to_hex()
            .to_string()
    }

    /// Directory holding this source's metadata record and chunk blobs.
    pub fn entry_dir(&self, source: &Path) -> PathBuf {
        self.root.join(Self::digest(source))
    }

    pub fn metadata_path(&self, source: &Path) -> PathBuf {
        self.entry_dir(source).join(METADATA_FILE)
    }

    pub fn chunk_path(&self, source: &Path, cx: u32, cy: u32) -> PathBuf {
        self.entry_dir(source).join(format!("chunk_{}_{}.bin", cx, cy))
    }

    /// Whether a committed, fully materialized entry exists for `source`.
    ///
    /// Parses the metadata record and stats every expected blob for the
    /// exact framed length; blob bytes are never read. Any failure along the
    /// way answers `false`, never an error.
    pub fn is_complete(&self, source: &Path) -> bool {
        let metadata = match self.read_metadata(source) {
            Ok(m) => m,
            Err(_) => return false,
        };
        if metadata.chunk_count() as u32 != metadata.chunks_x * metadata.chunks_y {
            return false;
        }
        for chunk in &metadata.chunks {
            let expected = blob::blob_len(chunk.width, chunk.height);
            match fs::metadata(self.chunk_path(source, chunk.cx, chunk.cy)) {
                Ok(stat) if stat.len() == expected => {}
                _ => return false,
            }
        }
        true
    }

    /// Read and parse the persisted metadata record.
    pub fn read_metadata(&self, source: &Path) -> Result<ImageMetadata> {
        let path = self.metadata_path(source);
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| ChunkError::InvalidMetadata(format!("{}: {}", path.display(), e)))
    }

    /// Persist the metadata record atomically: write to a temp file in the
    /// entry directory, then rename over the final name. The rename is the
    /// commit point for the whole entry.
    pub fn write_metadata(&self, source: &Path, metadata: &ImageMetadata) -> Result<()> {
        let dir = self.entry_dir(source);
        let tmp = dir.join("metadata.tmp");
        let content = serde_json::to_string(metadata)
            .map_err(|e| ChunkError::InvalidMetadata(e.to_string()))?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, self.metadata_path(source))?;
        Ok(())
    }

    /// Remove and recreate the entry directory, discarding any previous
    /// blobs and metadata for this source.
    pub fn recreate_entry_dir(&self, source: &Path) -> Result<PathBuf> {
        let dir = self.entry_dir(source);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            debug!("cleared stale cache entry dir={}", dir.display());
        }
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove the whole cache root. A missing root is not an error.
    pub fn clear_all(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}
