use std::path::Path;
use std::time::Instant;

use image::GenericImageView;
use tracing::info;

use crate::error::{ChunkError, Result};

/// Extensions accepted by the preprocessing entry points. The gate is
/// advisory; the decoder sniffs the actual container format and is
/// authoritative.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tiff", "webp"];

/// A fully decoded source image: RGBA8, row-major, top-left origin, no
/// stride padding, non-premultiplied alpha.
#[derive(Debug)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Check a path's extension against the supported set. Does not touch the
/// file.
pub fn check_extension(path: &Path) -> Result<()> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_lowercase();
    if SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(ChunkError::UnsupportedFormat { extension })
    }
}

/// Decode a source file into an RGBA8 buffer. The whole file is decoded in
/// one pass; there is no partial success.
pub fn decode_source(path: &Path) -> Result<DecodedImage> {
    check_extension(path)?;

    let start = Instant::now();
    let reader = image::ImageReader::open(path)
        .map_err(ChunkError::Io)?
        .with_guessed_format()
        .map_err(ChunkError::Io)?;
    let img = reader
        .decode()
        .map_err(|e| ChunkError::DecodeFailed(e.to_string()))?;

    let (width, height) = img.dimensions();
    let pixels = img.into_rgba8().into_raw();
    debug_assert_eq!(pixels.len(), width as usize * height as usize * 4);

    info!(
        "decoded source={} size={}x{} elapsed_ms={}",
        path.display(),
        width,
        height,
        start.elapsed().as_millis()
    );

    Ok(DecodedImage {
        width,
        height,
        pixels,
    })
}
