//! Source preprocessing: decode once, partition into chunks, write every
//! chunk blob in parallel, then commit the metadata record.

use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::blob;
use crate::cache::CacheStore;
use crate::codec::{self, DecodedImage};
use crate::error::Result;
use crate::types::{ChunkInfo, ImageMetadata};

/// Nominal chunk edge length when nothing else is configured.
pub const DEFAULT_CHUNK_SIZE: u32 = 1024;

#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    pub chunk_size: u32,
    /// Rewrite the entry even if a complete one exists.
    pub force: bool,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        PreprocessOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            force: false,
        }
    }
}

/// Guarantee a complete cache entry for `source` and return its metadata.
///
/// On a cache hit (complete entry, no `force`) the persisted record is
/// returned as-is and no blob is touched. Otherwise the source is decoded,
/// the entry directory is recreated, all chunk blobs are extracted and
/// written across the rayon pool, and the metadata record is committed last.
/// A failure before the commit leaves an entry that `is_complete` reports as
/// absent; the next call re-runs from scratch.
pub fn preprocess(
    store: &CacheStore,
    source: &Path,
    opts: &PreprocessOptions,
) -> Result<ImageMetadata> {
    if !opts.force && store.is_complete(source) {
        let metadata = store.read_metadata(source)?;
        info!(
            "cache hit source={} grid={}x{} chunks={}",
            source.display(),
            metadata.chunks_x,
            metadata.chunks_y,
            metadata.chunk_count()
        );
        return Ok(metadata);
    }

    let start = Instant::now();
    let decoded = codec::decode_source(source)?;
    let metadata = ImageMetadata::plan(decoded.width, decoded.height, opts.chunk_size)?;

    info!(
        "chunk plan source={} size={}x{} chunk_size={} grid={}x{} threads={}",
        source.display(),
        decoded.width,
        decoded.height,
        opts.chunk_size,
        metadata.chunks_x,
        metadata.chunks_y,
        rayon::current_num_threads()
    );

    let dir = store.recreate_entry_dir(source)?;

    let extract_start = Instant::now();
    metadata.chunks.par_iter().try_for_each(|chunk| {
        let pixels = extract_chunk(&decoded, chunk);
        let path = dir.join(format!("chunk_{}_{}.bin", chunk.cx, chunk.cy));
        blob::write_blob(&path, chunk.width, chunk.height, &pixels)?;
        debug!(
            "chunk written cx={} cy={} size={}x{} bytes={}",
            chunk.cx,
            chunk.cy,
            chunk.width,
            chunk.height,
            blob::blob_len(chunk.width, chunk.height)
        );
        Ok::<(), crate::error::ChunkError>(())
    })?;

    store.write_metadata(source, &metadata)?;

    info!(
        "preprocess done source={} chunks={} extract_ms={} total_ms={}",
        source.display(),
        metadata.chunk_count(),
        extract_start.elapsed().as_millis(),
        start.elapsed().as_millis()
    );

    Ok(metadata)
}

/// Copy one chunk's pixels out of the full decoded buffer. Each chunk row is
/// contiguous in the source, so the copy is one `copy_from_slice` per row.
fn extract_chunk(decoded: &DecodedImage, chunk: &ChunkInfo) -> Vec<u8> {
    let row_bytes = chunk.width as usize * 4;
    let total_row_bytes = decoded.width as usize * 4;
    let mut pixels = Vec::with_capacity(row_bytes * chunk.height as usize);

    for row in 0..chunk.height as usize {
        let src_row = chunk.y as usize + row;
        let start = src_row * total_row_bytes + chunk.x as usize * 4;
        pixels.extend_from_slice(&decoded.pixels[start..start + row_bytes]);
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::SystemTime;

    /// Deterministic RGBA test pattern: every pixel encodes its coordinates.
    fn test_pattern(width: u32, height: u32) -> image::RgbaImage {
        image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([x as u8, y as u8, (x ^ y) as u8, 255])
        })
    }

    fn setup(width: u32, height: u32) -> (tempfile::TempDir, CacheStore, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.png");
        test_pattern(width, height).save(&source).unwrap();
        let store = CacheStore::new(dir.path().join("chunk_cache"));
        (dir, store, source)
    }

    fn opts(chunk_size: u32) -> PreprocessOptions {
        PreprocessOptions {
            chunk_size,
            force: false,
        }
    }

    fn blob_mtimes(store: &CacheStore, source: &Path, m: &ImageMetadata) -> Vec<SystemTime> {
        m.chunks
            .iter()
            .map(|c| {
                fs::metadata(store.chunk_path(source, c.cx, c.cy))
                    .unwrap()
                    .modified()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn preprocess_materializes_a_complete_entry() {
        let (_dir, store, source) = setup(70, 50);
        let metadata = preprocess(&store, &source, &opts(32)).unwrap();

        assert_eq!((metadata.chunks_x, metadata.chunks_y), (3, 2));
        assert!(store.is_complete(&source));
        for c in &metadata.chunks {
            let bytes = fs::read(store.chunk_path(&source, c.cx, c.cy)).unwrap();
            assert_eq!(bytes.len() as u64, blob::blob_len(c.width, c.height));
        }
    }

    #[test]
    fn blobs_reproduce_source_regions_pixel_perfect() {
        let (_dir, store, source) = setup(70, 50);
        let metadata = preprocess(&store, &source, &opts(32)).unwrap();
        let pattern = test_pattern(70, 50);

        for c in &metadata.chunks {
            let bytes = fs::read(store.chunk_path(&source, c.cx, c.cy)).unwrap();
            let parsed = blob::parse_blob(&bytes).unwrap();
            assert_eq!((parsed.width, parsed.height), (c.width, c.height));
            for row in 0..c.height {
                for col in 0..c.width {
                    let px = pattern.get_pixel(c.x + col, c.y + row).0;
                    let idx = ((row * c.width + col) * 4) as usize;
                    assert_eq!(&parsed.pixels[idx..idx + 4], &px, "chunk ({},{})", c.cx, c.cy);
                }
            }
        }
    }

    #[test]
    fn second_call_is_a_pure_cache_hit() {
        let (_dir, store, source) = setup(70, 50);
        let first = preprocess(&store, &source, &opts(32)).unwrap();
        let metadata_before = fs::read(store.metadata_path(&source)).unwrap();
        let mtimes_before = blob_mtimes(&store, &source, &first);

        let second = preprocess(&store, &source, &opts(32)).unwrap();
        assert_eq!(second, first);
        assert_eq!(fs::read(store.metadata_path(&source)).unwrap(), metadata_before);
        assert_eq!(blob_mtimes(&store, &source, &first), mtimes_before);
    }

    #[test]
    fn force_rewrites_blobs_but_not_their_meaning() {
        let (_dir, store, source) = setup(70, 50);
        let first = preprocess(&store, &source, &opts(32)).unwrap();
        let mtimes_before = blob_mtimes(&store, &source, &first);

        // Coarse filesystem timestamps need a beat between the writes.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let forced = preprocess(
            &store,
            &source,
            &PreprocessOptions {
                chunk_size: 32,
                force: true,
            },
        )
        .unwrap();
        assert_eq!(forced, first);
        let mtimes_after = blob_mtimes(&store, &source, &first);
        assert_ne!(mtimes_after, mtimes_before);
        assert!(store.is_complete(&source));
    }

    #[test]
    fn incomplete_entry_is_rebuilt_without_force() {
        let (_dir, store, source) = setup(70, 50);
        let metadata = preprocess(&store, &source, &opts(32)).unwrap();

        fs::remove_file(store.chunk_path(&source, 0, 0)).unwrap();
        assert!(!store.is_complete(&source));

        let rebuilt = preprocess(&store, &source, &opts(32)).unwrap();
        assert_eq!(rebuilt, metadata);
        assert!(store.is_complete(&source));
    }

    #[test]
    fn exact_multiple_dimensions_yield_uniform_tiles() {
        let (_dir, store, source) = setup(64, 64);
        let metadata = preprocess(&store, &source, &opts(32)).unwrap();
        assert_eq!(metadata.chunk_count(), 4);
        assert!(metadata.chunks.iter().all(|c| c.width == 32 && c.height == 32));
    }

    #[test]
    fn one_pixel_source_writes_a_twelve_byte_blob() {
        let (_dir, store, source) = setup(1, 1);
        let metadata = preprocess(&store, &source, &opts(1024)).unwrap();
        assert_eq!(metadata.chunk_count(), 1);
        let bytes = fs::read(store.chunk_path(&source, 0, 0)).unwrap();
        assert_eq!(bytes.len(), 12);
    }

    #[test]
    fn decode_failure_leaves_no_committed_entry() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("broken.png");
        fs::write(&source, b"not a png at all").unwrap();
        let store = CacheStore::new(dir.path().join("chunk_cache"));

        let err = preprocess(&store, &source, &opts(32)).unwrap_err();
        assert_eq!(err.kind(), "decode_failed");
        assert!(!store.is_complete(&source));
    }
}
