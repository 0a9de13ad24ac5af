//! PNG codec adapter
//!
//! Converts between encoded PNG bytes and [`RasterImage`], the RGBA8 pixel
//! buffer the differ works on. Nothing here knows about viewports or runs.

use crate::{Error, Result};
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;

/// An RGBA8 raster. `pixels.len()` is always `width * height * 4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl RasterImage {
    /// Build a raster from raw RGBA bytes, validating the buffer length.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Codec(format!(
                "raster dimensions must be positive, got {}x{}",
                width, height
            )));
        }
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(Error::Codec(format!(
                "pixel buffer is {} bytes, expected {} for {}x{}",
                pixels.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self { width, height, pixels })
    }

    /// A raster where every pixel is `rgba`.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self> {
        let count = width as usize * height as usize;
        let pixels = rgba.iter().copied().cycle().take(count * 4).collect();
        Self::new(width, height, pixels)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// RGBA value at `(x, y)`; `None` when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        Some([self.pixels[i], self.pixels[i + 1], self.pixels[i + 2], self.pixels[i + 3]])
    }

    /// Copy this raster onto a `width` x `height` canvas filled with `fill`,
    /// anchored at the top-left corner. Content outside the canvas is cropped.
    pub fn padded_to(&self, width: u32, height: u32, fill: [u8; 4]) -> Result<Self> {
        let mut canvas = Self::filled(width, height, fill)?;
        let copy_w = self.width.min(width) as usize * 4;
        for y in 0..self.height.min(height) as usize {
            let src = y * self.width as usize * 4;
            let dst = y * width as usize * 4;
            canvas.pixels[dst..dst + copy_w].copy_from_slice(&self.pixels[src..src + copy_w]);
        }
        Ok(canvas)
    }
}

/// Decode PNG bytes into an RGBA8 raster.
pub fn decode_png(bytes: &[u8]) -> Result<RasterImage> {
    let img = image::load_from_memory_with_format(bytes, ImageFormat::Png)?.to_rgba8();
    let (width, height) = img.dimensions();
    RasterImage::new(width, height, img.into_raw())
}

/// Encode a raster as PNG bytes.
pub fn encode_png(image: &RasterImage) -> Result<Vec<u8>> {
    let buffer = RgbaImage::from_raw(image.width, image.height, image.pixels.clone())
        .ok_or_else(|| Error::Codec("pixel buffer does not match dimensions".into()))?;
    let mut out = Vec::new();
    buffer.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}
