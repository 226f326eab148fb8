//! Input image payloads and the preprocessing options sent with them.
//!
//! Decoding goes through the `image` crate; the only conversion done here is
//! packing 24-bit RGB into the device pixel formats.

use crate::error::{DeviceError, DeviceResult, PipelineError};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Pixel layout the device accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
  /// 16-bit `r5g6b5`, little endian.
  Rgb565,
  /// 32-bit `r, g, b, a` bytes.
  Rgba8888,
}

impl ImageFormat {
  pub fn bytes_per_pixel(self) -> usize {
    match self {
      ImageFormat::Rgb565 => 2,
      ImageFormat::Rgba8888 => 4,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
  Disable,
  Enable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingMode {
  None,
  Corner,
  Symmetric,
}

/// Normalization the device applies before the first layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizeMode {
  #[serde(rename = "none")]
  None,
  #[serde(rename = "0_1")]
  ZeroToOne,
  /// -0.5 ~ 0.5
  #[serde(rename = "kneron")]
  Kneron,
  #[serde(rename = "-1_1")]
  NegOneToOne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputOptions {
  pub resize: ResizeMode,
  pub padding: PaddingMode,
  pub normalize: NormalizeMode,
}

impl Default for InputOptions {
  fn default() -> Self {
    Self {
      resize: ResizeMode::Enable,
      padding: PaddingMode::Corner,
      normalize: NormalizeMode::Kneron,
    }
  }
}

/// A packed image ready to send. Cloning shares the pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputImage {
  pub width: u32,
  pub height: u32,
  pub format: ImageFormat,
  data: Arc<[u8]>,
}

impl InputImage {
  pub fn new(width: u32, height: u32, format: ImageFormat, data: Vec<u8>) -> DeviceResult<Self> {
    let expected = width as usize * height as usize * format.bytes_per_pixel();
    if data.len() != expected {
      return Err(DeviceError::InvalidParam(format!(
        "{}x{} {:?} image needs {} bytes, got {}",
        width,
        height,
        format,
        expected,
        data.len()
      )));
    }
    Ok(Self {
      width,
      height,
      format,
      data: data.into(),
    })
  }

  /// Pack tightly laid out 24-bit RGB pixels.
  pub fn from_rgb8(width: u32, height: u32, rgb: &[u8], format: ImageFormat) -> DeviceResult<Self> {
    let pixels = width as usize * height as usize;
    if rgb.len() != pixels * 3 {
      return Err(DeviceError::InvalidParam(format!(
        "{}x{} RGB image needs {} bytes, got {}",
        width,
        height,
        pixels * 3,
        rgb.len()
      )));
    }

    let mut data = Vec::with_capacity(pixels * format.bytes_per_pixel());
    for px in rgb.chunks_exact(3) {
      match format {
        ImageFormat::Rgb565 => data.extend_from_slice(&rgb565(px[0], px[1], px[2]).to_le_bytes()),
        ImageFormat::Rgba8888 => data.extend_from_slice(&[px[0], px[1], px[2], 0xff]),
      }
    }
    Self::new(width, height, format, data)
  }

  /// Decode an image file and pack it into `format`.
  pub fn load(path: &Path, format: ImageFormat) -> Result<Self, PipelineError> {
    let decoded = image::open(path).map_err(|e| PipelineError::Image(format!("{}: {}", path.display(), e)))?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    debug!("decoded {} as {}x{}", path.display(), width, height);
    Self::from_rgb8(width, height, rgb.as_raw(), format).map_err(|e| PipelineError::Image(e.to_string()))
  }

  /// Deterministic gradient, used when no image file is configured.
  pub fn test_pattern(width: u32, height: u32, format: ImageFormat) -> DeviceResult<Self> {
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
      for x in 0..width {
        let r = (x * 255 / width.max(1)) as u8;
        let g = (y * 255 / height.max(1)) as u8;
        let b = ((x + y) % 256) as u8;
        rgb.extend_from_slice(&[r, g, b]);
      }
    }
    Self::from_rgb8(width, height, &rgb, format)
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn size_bytes(&self) -> usize {
    self.data.len()
  }
}

/// Pack one pixel as `r5g6b5`, red in the high bits.
pub fn rgb565(r: u8, g: u8, b: u8) -> u16 {
  ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}
