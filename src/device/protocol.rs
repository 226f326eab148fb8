//! Raw descriptor layouts exchanged with the device.
//! All fields are little endian and 4-byte aligned.

use crate::error::{DeviceError, DeviceResult};
use crate::inference::InferenceRequest;
use crate::input::{ImageFormat, NormalizeMode, PaddingMode, ResizeMode};
use crate::model::{OutputNodeShape, MAX_MODELS};

/// Largest image payload the firmware buffers (image + descriptor).
pub const IMAGE_BUFFER_SIZE: usize = 2 * 1280 * 720 + 500;
/// Depth of the device inference FIFO.
pub const MAX_QUEUE_NUM: usize = 3;
/// Node rows are padded to this many bytes.
pub const COL_ALIGN: u32 = 16;

// image.config bits
pub const IMAGE_FORMAT_RAW_OUTPUT: u32 = 0x1000_0000;
pub const IMAGE_FORMAT_SUB128: u32 = 0x8000_0000;
pub const IMAGE_FORMAT_RIGHT_SHIFT_ONE_BIT: u32 = 0x0040_0000;
pub const NPU_FORMAT_RGB565: u32 = 0x60;

pub const RECV_HEADER_SIZE: usize = 20;
pub const NODE_DESCRIPTOR_SIZE: usize = 20;

pub const RETURN_SUCCESS: u32 = 0;
pub const RETURN_INVALID_MODEL_ID: u32 = 1;
pub const RETURN_INVALID_DESCRIPTOR_TYPE: u32 = 2;

/// Descriptor type of a user inference request and its result.
pub const DESC_TYPE_USER: u32 = 1000;

/// Largest raw output buffer a model may produce.
pub const MAX_RAW_OUT_SIZE: usize = 64 * 1024 * 1024;

/// Row stride for `width`. `None` if padding overflows.
pub fn round_up(width: u32) -> Option<u32> {
  width.checked_add(COL_ALIGN - 1).map(|w| w & !(COL_ALIGN - 1))
}

/// Bytes one node occupies in the raw output, row padding included.
/// `None` if the shape overflows.
pub fn node_raw_size(node: &OutputNodeShape) -> Option<usize> {
  (node.height as usize)
    .checked_mul(node.channel as usize)?
    .checked_mul(round_up(node.width)? as usize)
}

// Image config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageConfig {
  pub width: u32,
  pub height: u32,
  pub channel: u32,
  pub config: u32,
}

/// Inference request descriptor (84 bytes), followed on the wire by the
/// image payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendDescriptor {
  pub total_size: u32,
  pub desc_type: u32,
  pub request_id: u32,
  pub image: ImageConfig,
  pub use_builtin_model: bool,
  pub model_count: u32,
  pub model_ids: [u32; MAX_MODELS],
  pub resize: u32,
  pub padding: u32,
}

impl SendDescriptor {
  pub const SIZE: usize = 84;

  pub fn for_request(request: &InferenceRequest) -> DeviceResult<Self> {
    let image = &request.image;
    let image_size = image.size_bytes();
    if image_size > IMAGE_BUFFER_SIZE {
      return Err(DeviceError::SendDataTooLarge {
        size: image_size,
        limit: IMAGE_BUFFER_SIZE,
      });
    }

    let mut config = IMAGE_FORMAT_RAW_OUTPUT;
    config |= match request.options.normalize {
      NormalizeMode::None | NormalizeMode::ZeroToOne => 0,
      NormalizeMode::Kneron => IMAGE_FORMAT_SUB128,
      NormalizeMode::NegOneToOne => IMAGE_FORMAT_SUB128 | IMAGE_FORMAT_RIGHT_SHIFT_ONE_BIT,
    };
    if image.format == ImageFormat::Rgb565 {
      config |= NPU_FORMAT_RGB565;
    }

    let mut model_ids = [0u32; MAX_MODELS];
    model_ids[0] = request.model_id;

    Ok(Self {
      total_size: (Self::SIZE + image_size) as u32,
      desc_type: DESC_TYPE_USER,
      request_id: request.sequence,
      image: ImageConfig {
        width: image.width,
        height: image.height,
        channel: 3,
        config,
      },
      use_builtin_model: false,
      model_count: 1,
      model_ids,
      resize: resize_code(request.options.resize),
      padding: padding_code(request.options.padding),
    })
  }

  pub fn image_format(&self) -> ImageFormat {
    if self.image.config & NPU_FORMAT_RGB565 == NPU_FORMAT_RGB565 {
      ImageFormat::Rgb565
    } else {
      ImageFormat::Rgba8888
    }
  }

  pub fn image_size(&self) -> usize {
    self.image.width as usize * self.image.height as usize * self.image_format().bytes_per_pixel()
  }

  pub fn to_bytes(&self) -> [u8; Self::SIZE] {
    let mut out = [0u8; Self::SIZE];
    let mut words = vec![
      self.total_size,
      self.desc_type,
      self.request_id,
      self.image.width,
      self.image.height,
      self.image.channel,
      self.image.config,
      self.use_builtin_model as u32,
      self.model_count,
    ];
    words.extend_from_slice(&self.model_ids);
    words.push(self.resize);
    words.push(self.padding);
    for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
      chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
  }

  pub fn from_bytes(bytes: &[u8]) -> DeviceResult<Self> {
    let mut r = ByteReader::new(bytes);
    let total_size = r.u32()?;
    let desc_type = r.u32()?;
    let request_id = r.u32()?;
    let image = ImageConfig {
      width: r.u32()?,
      height: r.u32()?,
      channel: r.u32()?,
      config: r.u32()?,
    };
    let use_builtin_model = r.u32()? != 0;
    let model_count = r.u32()?;
    let mut model_ids = [0u32; MAX_MODELS];
    for id in model_ids.iter_mut() {
      *id = r.u32()?;
    }
    Ok(Self {
      total_size,
      desc_type,
      request_id,
      image,
      use_builtin_model,
      model_count,
      model_ids,
      resize: r.u32()?,
      padding: r.u32()?,
    })
  }
}

/// Descriptor plus payload, as written to the device.
pub fn encode_request(request: &InferenceRequest) -> DeviceResult<Vec<u8>> {
  let desc = SendDescriptor::for_request(request)?;
  let mut frame = Vec::with_capacity(desc.total_size as usize);
  frame.extend_from_slice(&desc.to_bytes());
  frame.extend_from_slice(request.image.data());
  Ok(frame)
}

pub fn resize_code(mode: ResizeMode) -> u32 {
  match mode {
    ResizeMode::Disable => 0,
    ResizeMode::Enable => 1,
  }
}

pub fn padding_code(mode: PaddingMode) -> u32 {
  match mode {
    PaddingMode::None => 0,
    PaddingMode::Corner => 1,
    PaddingMode::Symmetric => 2,
  }
}

// Result header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvHeader {
  pub total_size: u32,
  pub desc_type: u32,
  pub return_code: u32,
  pub request_id: u32,
  pub is_output_raw: bool,
}

impl RecvHeader {
  pub fn to_bytes(&self) -> [u8; RECV_HEADER_SIZE] {
    let mut out = [0u8; RECV_HEADER_SIZE];
    let words = [
      self.total_size,
      self.desc_type,
      self.return_code,
      self.request_id,
      self.is_output_raw as u32,
    ];
    for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
      chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
  }

  pub fn from_bytes(bytes: &[u8]) -> DeviceResult<Self> {
    let mut r = ByteReader::new(bytes);
    Ok(Self {
      total_size: r.u32()?,
      desc_type: r.u32()?,
      return_code: r.u32()?,
      request_id: r.u32()?,
      is_output_raw: r.u32()? != 0,
    })
  }
}

/// Build a raw output buffer. `data[i]` holds node `i` unpadded,
/// `height * channel` rows of `width` values.
pub fn encode_raw_output(request_id: u32, nodes: &[OutputNodeShape], data: &[Vec<i8>]) -> DeviceResult<Vec<u8>> {
  if nodes.len() != data.len() {
    return Err(DeviceError::InvalidParam(format!(
      "{} node shapes but {} node buffers",
      nodes.len(),
      data.len()
    )));
  }

  let raw_total = nodes
    .iter()
    .try_fold(0usize, |acc, node| acc.checked_add(node_raw_size(node)?))
    .filter(|&size| size <= MAX_RAW_OUT_SIZE)
    .ok_or_else(|| DeviceError::InvalidParam("node shapes exceed the raw output limit".to_string()))?;
  let total = RECV_HEADER_SIZE + 4 + nodes.len() * NODE_DESCRIPTOR_SIZE + raw_total;
  let mut out = Vec::with_capacity(total);

  let header = RecvHeader {
    total_size: total as u32,
    desc_type: DESC_TYPE_USER,
    return_code: RETURN_SUCCESS,
    request_id,
    is_output_raw: true,
  };
  out.extend_from_slice(&header.to_bytes());
  out.extend_from_slice(&(nodes.len() as u32).to_le_bytes());
  for node in nodes {
    out.extend_from_slice(&node.width.to_le_bytes());
    out.extend_from_slice(&node.height.to_le_bytes());
    out.extend_from_slice(&node.channel.to_le_bytes());
    out.extend_from_slice(&node.radix.to_le_bytes());
    out.extend_from_slice(&node.scale.to_le_bytes());
  }

  for (node, values) in nodes.iter().zip(data) {
    let width = node.width as usize;
    let rows = node.height as usize * node.channel as usize;
    if values.len() != rows * width {
      return Err(DeviceError::InvalidParam(format!(
        "node {}x{}x{} needs {} values, got {}",
        node.width,
        node.height,
        node.channel,
        rows * width,
        values.len()
      )));
    }
    // stride is Some: raw_total above was computed from it
    let pad = round_up(node.width).map_or(0, |stride| stride as usize - width);
    for row in values.chunks_exact(width.max(1)).take(rows) {
      out.extend(row.iter().map(|&v| v as u8));
      out.extend(std::iter::repeat(0u8).take(pad));
    }
  }

  Ok(out)
}

/// Error-only result: a header with a non-zero return code.
pub fn encode_error_output(request_id: u32, return_code: u32) -> Vec<u8> {
  let header = RecvHeader {
    total_size: (RECV_HEADER_SIZE + 4) as u32,
    desc_type: DESC_TYPE_USER,
    return_code,
    request_id,
    is_output_raw: true,
  };
  let mut out = header.to_bytes().to_vec();
  out.extend_from_slice(&0u32.to_le_bytes());
  out
}

/// Parsed view over a raw output buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutputLayout {
  pub header: RecvHeader,
  pub nodes: Vec<OutputNodeShape>,
  /// Byte offset of each node's data within the buffer.
  pub offsets: Vec<usize>,
}

impl RawOutputLayout {
  pub fn parse(buf: &[u8]) -> DeviceResult<Self> {
    let header = RecvHeader::from_bytes(buf)?;
    let mut r = ByteReader::new(&buf[RECV_HEADER_SIZE..]);
    let count = r.u32()? as usize;
    let room = (buf.len() - RECV_HEADER_SIZE - 4) / NODE_DESCRIPTOR_SIZE;
    if count > room {
      return Err(DeviceError::MalformedOutput(format!(
        "{} node descriptors do not fit in {} bytes",
        count,
        buf.len()
      )));
    }

    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
      nodes.push(OutputNodeShape {
        width: r.u32()?,
        height: r.u32()?,
        channel: r.u32()?,
        radix: r.u32()?,
        scale: r.f32()?,
      });
    }

    let mut offset = RECV_HEADER_SIZE + 4 + count * NODE_DESCRIPTOR_SIZE;
    let mut offsets = Vec::with_capacity(count);
    for node in &nodes {
      offsets.push(offset);
      offset = node_raw_size(node)
        .and_then(|size| offset.checked_add(size))
        .ok_or_else(|| {
          DeviceError::MalformedOutput(format!(
            "node {}x{}x{} overflows the output size",
            node.width, node.height, node.channel
          ))
        })?;
    }
    if offset > buf.len() {
      return Err(DeviceError::MalformedOutput(format!(
        "node data needs {} bytes, buffer holds {}",
        offset,
        buf.len()
      )));
    }

    Ok(Self { header, nodes, offsets })
  }
}

struct ByteReader<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> ByteReader<'a> {
  fn new(buf: &'a [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  fn take4(&mut self) -> DeviceResult<[u8; 4]> {
    let bytes = self
      .buf
      .get(self.pos..self.pos + 4)
      .ok_or_else(|| DeviceError::MalformedOutput(format!("truncated at byte {}", self.pos)))?;
    self.pos += 4;
    Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
  }

  fn u32(&mut self) -> DeviceResult<u32> {
    self.take4().map(u32::from_le_bytes)
  }

  fn f32(&mut self) -> DeviceResult<f32> {
    self.take4().map(f32::from_le_bytes)
  }
}
