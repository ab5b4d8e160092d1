//! Grayscale frame type shared by cameras, uploads and the embedding provider.

use image::{GrayImage, ImageFormat};
use std::io::Cursor;
use thiserror::Error;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("frame has zero width or height")]
    Empty,
}

/// A single 8-bit grayscale frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Row-major pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Driver sequence number for camera frames, 0 for still images.
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        let expected = (width as usize) * (height as usize);
        if data.len() < expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        let mut data = data;
        data.truncate(expected);
        Ok(Self {
            data,
            width,
            height,
            sequence: 0,
        })
    }

    /// Decode an encoded still image (PNG, JPEG, ...) into a grayscale frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let gray = image::load_from_memory(bytes)?.to_luma8();
        let (width, height) = gray.dimensions();
        Self::new(gray.into_raw(), width, height)
    }

    /// Encode as PNG for transport to the embedding provider.
    pub fn encode_png(&self) -> Result<Vec<u8>, FrameError> {
        let img = GrayImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameError::InvalidLength {
                expected: (self.width as usize) * (self.height as usize),
                actual: self.data.len(),
            },
        )?;
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    pub fn is_dark(&self) -> bool {
        is_dark_frame(&self.data, DARK_FRAME_RATIO)
    }
}

/// True if more than `threshold_pct` of pixels are below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

/// Check that `bytes` is a decodable image and return its dimensions.
pub fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32), FrameError> {
    let img = image::load_from_memory(bytes)?;
    Ok((img.width(), img.height()))
}
