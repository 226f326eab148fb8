//! Inference requests, raw results and node retrieval.

use crate::device::protocol::{round_up, RawOutputLayout, RETURN_SUCCESS};
use crate::error::{DeviceError, DeviceResult};
use crate::input::{InputImage, InputOptions};
use serde::{Deserialize, Serialize};

/// One image submission. Built fresh for every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
  pub sequence: u32,
  pub model_id: u32,
  pub image: InputImage,
  pub options: InputOptions,
}

/// A completed inference in raw device format.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
  layout: RawOutputLayout,
  raw: Vec<u8>,
}

impl InferenceResult {
  /// Parse a raw output buffer. A non-zero firmware return code is an error.
  pub fn from_raw(raw: Vec<u8>) -> DeviceResult<Self> {
    let layout = RawOutputLayout::parse(&raw)?;
    if layout.header.return_code != RETURN_SUCCESS {
      return Err(DeviceError::Firmware(layout.header.return_code));
    }
    Ok(Self { layout, raw })
  }

  /// Sequence number echoed by the device.
  pub fn sequence(&self) -> u32 {
    self.layout.header.request_id
  }

  pub fn num_output_node(&self) -> u32 {
    self.layout.nodes.len() as u32
  }

  pub fn raw(&self) -> &[u8] {
    &self.raw
  }

  /// Dequantize one node into floats laid out as `ordering`.
  pub fn retrieve_float_node(&self, node_idx: u32, ordering: ChannelOrdering) -> DeviceResult<NodeOutput> {
    let idx = node_idx as usize;
    let node = self.layout.nodes.get(idx).ok_or_else(|| {
      DeviceError::InvalidParam(format!(
        "node index {} out of range, result has {} nodes",
        node_idx,
        self.layout.nodes.len()
      ))
    })?;

    let (width, height, channel) = (node.width as usize, node.height as usize, node.channel as usize);
    let aligned = round_up(node.width)
      .ok_or_else(|| DeviceError::MalformedOutput(format!("node width {} overflows the row stride", node.width)))?
      as usize;
    let factor = 1.0 / (node.scale * 2f32.powi(node.radix as i32));
    let base = self.layout.offsets[idx];

    let mut data = vec![0.0f32; width * height * channel];
    for h in 0..height {
      for c in 0..channel {
        let row = base + (h * channel + c) * aligned;
        for w in 0..width {
          let value = self.raw[row + w] as i8 as f32 * factor;
          let out = match ordering {
            ChannelOrdering::Hcw => (h * channel + c) * width + w,
            ChannelOrdering::Chw => (c * height + h) * width + w,
            ChannelOrdering::Hwc => (h * width + w) * channel + c,
          };
          data[out] = value;
        }
      }
    }

    Ok(NodeOutput {
      width: node.width,
      height: node.height,
      channel: node.channel,
      ordering,
      data,
    })
  }

  /// All nodes, in index order.
  pub fn retrieve_all_nodes(&self, ordering: ChannelOrdering) -> DeviceResult<Vec<NodeOutput>> {
    (0..self.num_output_node())
      .map(|idx| self.retrieve_float_node(idx, ordering))
      .collect()
  }
}

/// Memory order of a retrieved node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrdering {
  /// Native device order.
  Hcw,
  Chw,
  Hwc,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutput {
  pub width: u32,
  pub height: u32,
  pub channel: u32,
  pub ordering: ChannelOrdering,
  pub data: Vec<f32>,
}

impl NodeOutput {
  pub fn num_data(&self) -> usize {
    self.data.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::device::protocol::{encode_error_output, encode_raw_output, RETURN_INVALID_MODEL_ID};
  use crate::model::OutputNodeShape;

  // width 2, height 2, channel 3; value = 50*h + 10*c + w
  fn sample() -> InferenceResult {
    let shape = OutputNodeShape {
      width: 2,
      height: 2,
      channel: 3,
      radix: 0,
      scale: 1.0,
    };
    let mut values = Vec::new();
    for h in 0..2i8 {
      for c in 0..3i8 {
        for w in 0..2i8 {
          values.push(h * 50 + c * 10 + w);
        }
      }
    }
    InferenceResult::from_raw(encode_raw_output(7, &[shape], &[values]).unwrap()).unwrap()
  }

  #[test]
  fn test_result_header() {
    let result = sample();
    assert_eq!(result.sequence(), 7);
    assert_eq!(result.num_output_node(), 1);
  }

  #[test]
  fn test_channel_orderings() {
    let result = sample();

    let hcw = result.retrieve_float_node(0, ChannelOrdering::Hcw).unwrap();
    assert_eq!(&hcw.data[..4], &[0.0, 1.0, 10.0, 11.0]);

    let chw = result.retrieve_float_node(0, ChannelOrdering::Chw).unwrap();
    // c=0: h0w0 h0w1 h1w0 h1w1
    assert_eq!(&chw.data[..4], &[0.0, 1.0, 50.0, 51.0]);

    let hwc = result.retrieve_float_node(0, ChannelOrdering::Hwc).unwrap();
    // h=0,w=0: c0 c1 c2
    assert_eq!(&hwc.data[..3], &[0.0, 10.0, 20.0]);
    assert_eq!(hwc.num_data(), 12);
  }

  #[test]
  fn test_dequantize() {
    let shape = OutputNodeShape {
      width: 1,
      height: 1,
      channel: 2,
      radix: 2,
      scale: 0.5,
    };
    let raw = encode_raw_output(0, &[shape], &[vec![-8, 6]]).unwrap();
    let node = InferenceResult::from_raw(raw)
      .unwrap()
      .retrieve_float_node(0, ChannelOrdering::Chw)
      .unwrap();
    // 1 / (0.5 * 4) = 0.5
    assert_eq!(node.data, vec![-4.0, 3.0]);
  }

  #[test]
  fn test_node_index_out_of_range() {
    assert!(sample().retrieve_float_node(1, ChannelOrdering::Chw).is_err());
  }

  #[test]
  fn test_overflowing_node_is_error() {
    let mut raw = encode_error_output(0, RETURN_SUCCESS);
    raw[20..24].copy_from_slice(&1u32.to_le_bytes());
    for word in [0xffff_fff0u32, u32::MAX, u32::MAX, 0] {
      raw.extend_from_slice(&word.to_le_bytes());
    }
    raw.extend_from_slice(&1.0f32.to_le_bytes());
    assert!(matches!(InferenceResult::from_raw(raw), Err(DeviceError::MalformedOutput(_))));
  }

  #[test]
  fn test_firmware_error_code() {
    let err = InferenceResult::from_raw(encode_error_output(3, RETURN_INVALID_MODEL_ID)).unwrap_err();
    assert!(matches!(err, DeviceError::Firmware(RETURN_INVALID_MODEL_ID)));
  }
}
