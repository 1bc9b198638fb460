//! Texture upload seam between the chunk manager and the renderer.
//!
//! The manager only hands finished RGBA8 pixel arrays across this trait; the
//! shader program, vertex buffers and viewport math live with the renderer.

use crate::error::{ChunkError, Result};

/// Backend that turns a chunk's pixels into a texture handle the renderer
/// can sample. One handle per chunk; dropping the handle releases the
/// texture.
pub trait TextureUploader {
    type Texture;

    fn upload_rgba8(&mut self, width: u32, height: u32, pixels: &[u8]) -> Result<Self::Texture>;
}

/// Uploader for headless runs and tests: validates sizes, counts uploads,
/// returns lightweight handles.
#[derive(Default)]
pub struct HeadlessUploader {
    uploads: u64,
}

/// Handle issued by [`HeadlessUploader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadlessTexture {
    pub id: u64,
    pub width: u32,
    pub height: u32,
}

impl HeadlessUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads
    }
}

impl TextureUploader for HeadlessUploader {
    type Texture = HeadlessTexture;

    fn upload_rgba8(&mut self, width: u32, height: u32, pixels: &[u8]) -> Result<HeadlessTexture> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(ChunkError::GpuUpload(format!(
                "expected {} bytes for {}x{} RGBA8, got {}",
                expected,
                width,
                height,
                pixels.len()
            )));
        }
        self.uploads += 1;
        Ok(HeadlessTexture {
            id: self.uploads,
            width,
            height,
        })
    }
}

/// Surface-less wgpu device/queue pair for chunk uploads.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Bring up an adapter with no compatible surface; the viewer shell owns
    /// the presentation side.
    pub fn new_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| ChunkError::GpuUpload(format!("no suitable adapter: {}", e)))?;

        let (device, queue) =
            pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default()))
                .map_err(|e| ChunkError::GpuUpload(format!("device request failed: {}", e)))?;

        Ok(GpuContext { device, queue })
    }
}

/// One uploaded chunk: texture, view and the sampler the renderer binds.
pub struct ChunkTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub sampler: wgpu::Sampler,
    pub width: u32,
    pub height: u32,
}

/// Real uploader: one 2D RGBA8 texture per chunk, mip level 0 only,
/// clamp-to-edge wrapping and nearest filtering.
pub struct WgpuUploader {
    ctx: GpuContext,
}

impl WgpuUploader {
    pub fn new(ctx: GpuContext) -> Self {
        WgpuUploader { ctx }
    }
}

impl TextureUploader for WgpuUploader {
    type Texture = ChunkTexture;

    fn upload_rgba8(&mut self, width: u32, height: u32, pixels: &[u8]) -> Result<ChunkTexture> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(ChunkError::GpuUpload(format!(
                "expected {} bytes for {}x{} RGBA8, got {}",
                expected,
                width,
                height,
                pixels.len()
            )));
        }

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        // Collect validation failures from the whole create+upload sequence
        // instead of letting wgpu's uncaptured handler abort the process.
        self.ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let texture = self.ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("chunk texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        self.ctx.queue.write_texture(
            texture.as_image_copy(),
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            size,
        );

        if let Some(err) = pollster::block_on(self.ctx.device.pop_error_scope()) {
            return Err(ChunkError::GpuUpload(err.to_string()));
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = self.ctx.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("chunk sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Ok(ChunkTexture {
            texture,
            view,
            sampler,
            width,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_uploader_checks_pixel_length() {
        let mut up = HeadlessUploader::new();
        let err = up.upload_rgba8(4, 4, &[0u8; 10]).unwrap_err();
        assert_eq!(err.kind(), "gpu_upload_failed");
        assert_eq!(up.upload_count(), 0);

        let tex = up.upload_rgba8(4, 4, &[0u8; 64]).unwrap();
        assert_eq!((tex.width, tex.height), (4, 4));
        assert_eq!(up.upload_count(), 1);
    }

    #[test]
    fn headless_handles_are_distinct() {
        let mut up = HeadlessUploader::new();
        let a = up.upload_rgba8(1, 1, &[0u8; 4]).unwrap();
        let b = up.upload_rgba8(1, 1, &[0u8; 4]).unwrap();
        assert_ne!(a.id, b.id);
    }
}
