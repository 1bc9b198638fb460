//! Chunk blob wire format.
//!
//! One file per chunk, named `chunk_{cx}_{cy}.bin`:
//!
//! ```text
//! offset  size   field
//! 0       4      width  (u32, big-endian)
//! 4       4      height (u32, big-endian)
//! 8       w*h*4  RGBA pixels, row-major, top-left origin, non-premultiplied
//! ```
//!
//! The header is redundant with the metadata record on purpose: a viewer can
//! size its pixel upload from the blob alone, and a header/body mismatch is
//! detectable without trusting metadata.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{ChunkError, Result};

/// Byte length of the `[width][height]` header.
pub const HEADER_LEN: usize = 8;

/// A parsed chunk blob. The dimensions come from the blob's own header and
/// are authoritative over the metadata record for this chunk.
#[derive(Debug)]
pub struct ChunkPixels {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Expected total blob length for a `width` x `height` chunk.
pub fn blob_len(width: u32, height: u32) -> u64 {
    HEADER_LEN as u64 + width as u64 * height as u64 * 4
}

/// Write a framed chunk blob through a memory map. The file is created (or
/// truncated), sized up front, and flushed before returning.
pub fn write_blob(path: &Path, width: u32, height: u32, pixels: &[u8]) -> Result<()> {
    debug_assert_eq!(pixels.len() as u64 + HEADER_LEN as u64, blob_len(width, height));

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(blob_len(width, height))?;

    // SAFETY: the file was just created with this exact length and is not
    // shared until the mapping is flushed and dropped.
    let mut map = unsafe { MmapMut::map_mut(&file)? };
    map[0..4].copy_from_slice(&width.to_be_bytes());
    map[4..8].copy_from_slice(&height.to_be_bytes());
    map[HEADER_LEN..].copy_from_slice(pixels);
    map.flush()?;
    Ok(())
}

/// Parse a chunk blob, validating that the header and body sizes agree.
pub fn parse_blob(bytes: &[u8]) -> Result<ChunkPixels> {
    if bytes.len() < HEADER_LEN {
        return Err(ChunkError::Framing(format!(
            "blob is {} bytes, shorter than the {}-byte header",
            bytes.len(),
            HEADER_LEN
        )));
    }
    let width = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let height = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    // u128 math so a garbage header cannot overflow the size check.
    let body = (bytes.len() - HEADER_LEN) as u128;
    let expected = width as u128 * height as u128 * 4;
    if body != expected {
        return Err(ChunkError::Framing(format!(
            "header declares {}x{} ({} pixel bytes) but body is {} bytes",
            width, height, expected, body
        )));
    }

    Ok(ChunkPixels {
        width,
        height,
        pixels: bytes[HEADER_LEN..].to_vec(),
    })
}
