//! Viewer-side half of the pipeline: per-chunk state, bounded fetch
//! concurrency, spatial load order and the texture upload seam.

pub mod gpu;
pub mod manager;
pub mod scheduler;

pub use gpu::{HeadlessUploader, TextureUploader, WgpuUploader};
pub use manager::{ChunkManager, ChunkStatus, ChunkTransport, StatusStats, DEFAULT_FETCH_SLOTS};
pub use scheduler::parity_batches;
