use std::path::Path;
use tracing::{error, info};

use crate::error::AvatarError;

#[derive(Debug, thiserror::Error)]
pub enum TextureError {
    #[error("Failed to load image: {0}")]
    LoadFailed(#[from] image::ImageError),
    #[error("Invalid texture layout: {reason}")]
    InvalidLayout { reason: String },
}

impl From<TextureError> for AvatarError {
    fn from(err: TextureError) -> Self {
        AvatarError::InvalidTexture { reason: err.to_string() }
    }
}

/// Raw 8-bit pixel buffer as delivered by the asset collaborator. Rows are
/// tightly packed, `components` channels per pixel, alpha last.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    width: u32,
    height: u32,
    components: u8,
    pixels: Vec<u8>,
}

impl TextureData {
    pub fn new(width: u32, height: u32, components: u8, pixels: Vec<u8>) -> Result<Self, TextureError> {
        check_layout(&pixels, width, height, components)?;
        Ok(Self { width, height, components, pixels })
    }

    pub fn from_image(img: &image::DynamicImage) -> Self {
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self {
            width,
            height,
            components: 4,
            pixels: rgba.into_raw(),
        }
    }

    pub fn open(path: &Path) -> Result<Self, TextureError> {
        match image::open(path) {
            Ok(img) => {
                info!("Loaded texture: {:?}", path);
                Ok(Self::from_image(&img))
            }
            Err(e) => {
                error!("Failed to load texture: {:?}, error: {}", path, e);
                Err(TextureError::LoadFailed(e))
            }
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn components(&self) -> u8 {
        self.components
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    fn texel(&self, x: u32, y: u32) -> &[u8] {
        let c = self.components as usize;
        let start = (y as usize * self.width as usize + x as usize) * c;
        &self.pixels[start..start + c]
    }

    /// Expand a texel to RGBA. One channel is luminance, two is luminance+alpha.
    pub fn rgba(&self, x: u32, y: u32) -> [u8; 4] {
        match *self.texel(x, y) {
            [l] => [l, l, l, 255],
            [l, a] => [l, l, l, a],
            [r, g, b] => [r, g, b, 255],
            [r, g, b, a, ..] => [r, g, b, a],
            [] => [0, 0, 0, 0],
        }
    }

    /// Last channel of the texel
    pub fn alpha(&self, x: u32, y: u32) -> u8 {
        self.texel(x, y).last().copied().unwrap_or(0)
    }

    /// Nearest texel for a destination pixel when resampling to `dst_w` x `dst_h`
    pub fn nearest_for(&self, x: u32, y: u32, dst_w: u32, dst_h: u32) -> (u32, u32) {
        let sx = (x as u64 * self.width as u64 / dst_w.max(1) as u64) as u32;
        let sy = (y as u64 * self.height as u64 / dst_h.max(1) as u64) as u32;
        (sx.min(self.width - 1), sy.min(self.height - 1))
    }
}

/// Validate that `pixels` holds a `width` x `height` image with `components`
/// channels per pixel.
pub fn check_layout(pixels: &[u8], width: u32, height: u32, components: u8) -> Result<(), TextureError> {
    if width == 0 || height == 0 {
        return Err(TextureError::InvalidLayout {
            reason: format!("empty dimensions {}x{}", width, height),
        });
    }
    if !(1..=4).contains(&components) {
        return Err(TextureError::InvalidLayout {
            reason: format!("unsupported component count {}", components),
        });
    }
    let needed = width as usize * height as usize * components as usize;
    if pixels.len() < needed {
        return Err(TextureError::InvalidLayout {
            reason: format!("need {} bytes, have {}", needed, pixels.len()),
        });
    }
    Ok(())
}

/// Write a tightly packed RGBA8 buffer as an image file (format from extension)
pub fn save_rgba(path: &Path, width: u32, height: u32, pixels: Vec<u8>) -> Result<(), TextureError> {
    let img = image::RgbaImage::from_raw(width, height, pixels).ok_or_else(|| TextureError::InvalidLayout {
        reason: format!("buffer does not match {}x{} RGBA", width, height),
    })?;
    img.save(path)?;
    Ok(())
}
