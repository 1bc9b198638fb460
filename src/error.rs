use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the preprocessing pipeline, the chunk server and the
/// viewer-side chunk manager. All variants are fatal to the current
/// operation; nothing is retried automatically.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// Source path does not exist
    #[error("source file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    /// Extension not in the supported set
    #[error("unsupported image format '{extension}' (supported: png, jpg, jpeg, bmp, tiff, webp)")]
    UnsupportedFormat { extension: String },

    /// The codec rejected the source
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// Read/write/rename failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// get_chunk called for a source without a complete cache entry
    #[error("source not preprocessed: {}", path.display())]
    NotPreprocessed { path: PathBuf },

    /// A blob's header and body sizes are inconsistent
    #[error("chunk framing mismatch: {0}")]
    Framing(String),

    /// Texture creation or upload returned a failure
    #[error("gpu upload failed: {0}")]
    GpuUpload(String),

    /// A metadata record failed validation at viewer init
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
}

impl ChunkError {
    /// Machine-readable kind tag, stable across the request boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            ChunkError::FileNotFound { .. } => "file_not_found",
            ChunkError::UnsupportedFormat { .. } => "unsupported_format",
            ChunkError::DecodeFailed(_) => "decode_failed",
            ChunkError::Io(_) => "io_error",
            ChunkError::NotPreprocessed { .. } => "not_preprocessed",
            ChunkError::Framing(_) => "framing_error",
            ChunkError::GpuUpload(_) => "gpu_upload_failed",
            ChunkError::InvalidMetadata(_) => "invalid_metadata",
        }
    }
}

pub type Result<T> = std::result::Result<T, ChunkError>;
