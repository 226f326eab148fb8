//! Model descriptors and the TOML manifest the simulated device loads in
//! place of a compiled model file.

use crate::device::protocol::{node_raw_size, IMAGE_BUFFER_SIZE, MAX_RAW_OUT_SIZE, NODE_DESCRIPTOR_SIZE, RECV_HEADER_SIZE};
use crate::device::ProductId;
use crate::error::{DeviceError, DeviceResult};
use crate::input::ImageFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Maximum models one upload may carry.
pub const MAX_MODELS: usize = 10;

/// Shape and quantization of one output node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputNodeShape {
  pub width: u32,
  pub height: u32,
  pub channel: u32,
  #[serde(default)]
  pub radix: u32,
  #[serde(default = "default_scale")]
  pub scale: f32,
}

fn default_scale() -> f32 {
  1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleModelDescriptor {
  pub id: u32,
  #[serde(default)]
  pub name: String,
  pub width: u32,
  pub height: u32,
  pub channel: u32,
  pub image_format: ImageFormat,
  pub outputs: Vec<OutputNodeShape>,
}

impl SingleModelDescriptor {
  /// Size of the raw output buffer this model needs, `None` on overflow.
  pub fn max_raw_out_size(&self) -> Option<usize> {
    let descriptors = self.outputs.len().checked_mul(NODE_DESCRIPTOR_SIZE)?;
    self
      .outputs
      .iter()
      .try_fold(RECV_HEADER_SIZE + 4 + descriptors, |acc, node| acc.checked_add(node_raw_size(node)?))
  }

  /// Bytes of one input image in the model's own format, `None` on overflow.
  pub fn input_size(&self) -> Option<usize> {
    (self.width as usize)
      .checked_mul(self.height as usize)?
      .checked_mul(self.image_format.bytes_per_pixel())
  }
}

/// Everything a model upload reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
  pub target: ProductId,
  #[serde(default)]
  pub crc: u32,
  pub models: Vec<SingleModelDescriptor>,
}

impl ModelDescriptor {
  pub fn find(&self, id: u32) -> Option<&SingleModelDescriptor> {
    self.models.iter().find(|m| m.id == id)
  }
}

/// Read and check a model manifest.
pub fn load_manifest(path: &Path) -> DeviceResult<ModelDescriptor> {
  let load_err = |reason: String| DeviceError::ModelLoad {
    path: path.to_path_buf(),
    reason,
  };

  let content = fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
  let descriptor: ModelDescriptor = toml::from_str(&content).map_err(|e| load_err(e.to_string()))?;

  if descriptor.models.is_empty() {
    return Err(load_err("manifest contains no models".to_string()));
  }
  if descriptor.models.len() > MAX_MODELS {
    return Err(load_err(format!(
      "manifest contains {} models, at most {} are supported",
      descriptor.models.len(),
      MAX_MODELS
    )));
  }
  for model in &descriptor.models {
    if model.outputs.is_empty() {
      return Err(load_err(format!("model {} has no output nodes", model.id)));
    }
    if model.width == 0 || model.height == 0 {
      return Err(load_err(format!("model {} has an empty input shape", model.id)));
    }
    if model.outputs.iter().any(|n| n.scale == 0.0 || n.radix > 31) {
      return Err(load_err(format!("model {} has invalid quantization parameters", model.id)));
    }
    if !model.input_size().is_some_and(|size| size <= IMAGE_BUFFER_SIZE) {
      return Err(load_err(format!(
        "model {} input {}x{} exceeds the device image buffer",
        model.id, model.width, model.height
      )));
    }
    if !model.max_raw_out_size().is_some_and(|size| size <= MAX_RAW_OUT_SIZE) {
      return Err(load_err(format!("model {} output nodes exceed the raw output limit", model.id)));
    }
  }

  Ok(descriptor)
}
