use serde::{Deserialize, Serialize};
use std::cmp;

use crate::error::{ChunkError, Result};

/// Placement of one chunk within the source image. Bottom/right edge chunks
/// may be smaller than the nominal chunk size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Grid column index
    pub cx: u32,
    /// Grid row index
    pub cy: u32,
    /// Pixel X of the chunk's top-left corner in the source
    pub x: u32,
    /// Pixel Y of the chunk's top-left corner in the source
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Per-source metadata record, persisted as JSON in the cache entry.
///
/// The `chunk_size` recorded here is the single source of truth for the
/// grid; viewers must not assume a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub total_width: u32,
    pub total_height: u32,
    /// Nominal (square) chunk edge length in pixels
    pub chunk_size: u32,
    /// Number of grid columns
    pub chunks_x: u32,
    /// Number of grid rows
    pub chunks_y: u32,
    /// All chunks, row-major
    pub chunks: Vec<ChunkInfo>,
}

impl ImageMetadata {
    /// Partition a `total_width` x `total_height` image into a grid of
    /// `chunk_size`-sized tiles, ragged at the right/bottom edges.
    pub fn plan(total_width: u32, total_height: u32, chunk_size: u32) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ChunkError::InvalidMetadata(
                "chunk_size must be at least 1".into(),
            ));
        }
        if total_width == 0 || total_height == 0 {
            return Err(ChunkError::InvalidMetadata(format!(
                "image has empty dimensions {}x{}",
                total_width, total_height
            )));
        }

        let chunks_x = (total_width + chunk_size - 1) / chunk_size;
        let chunks_y = (total_height + chunk_size - 1) / chunk_size;

        let mut chunks = Vec::with_capacity((chunks_x * chunks_y) as usize);
        for cy in 0..chunks_y {
            for cx in 0..chunks_x {
                let x = cx * chunk_size;
                let y = cy * chunk_size;
                chunks.push(ChunkInfo {
                    cx,
                    cy,
                    x,
                    y,
                    width: cmp::min(chunk_size, total_width - x),
                    height: cmp::min(chunk_size, total_height - y),
                });
            }
        }

        Ok(ImageMetadata {
            total_width,
            total_height,
            chunk_size,
            chunks_x,
            chunks_y,
            chunks,
        })
    }

    /// Re-check every grid invariant. Run on records read back from disk
    /// before the viewer builds per-chunk state from them.
    pub fn validate(&self) -> Result<()> {
        let planned = ImageMetadata::plan(self.total_width, self.total_height, self.chunk_size)?;
        if planned.chunks_x != self.chunks_x || planned.chunks_y != self.chunks_y {
            return Err(ChunkError::InvalidMetadata(format!(
                "grid {}x{} does not match dimensions {}x{} at chunk_size {}",
                self.chunks_x, self.chunks_y, self.total_width, self.total_height, self.chunk_size
            )));
        }
        if planned.chunks != self.chunks {
            return Err(ChunkError::InvalidMetadata(
                "chunk list does not match the dimension formulas".into(),
            ));
        }
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk(&self, cx: u32, cy: u32) -> Option<&ChunkInfo> {
        if cx >= self.chunks_x || cy >= self.chunks_y {
            return None;
        }
        self.chunks.get((cy * self.chunks_x + cx) as usize)
    }
}
