use super::protocol::*;
use super::{DeviceDescriptor, DeviceProvider, NpuDevice, ProductId, UsbSpeed};
use crate::error::{DeviceError, DeviceResult};
use crate::inference::{InferenceRequest, InferenceResult};
use crate::input::ResizeMode;
use crate::model::{self, ModelDescriptor, SingleModelDescriptor};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Firmware answer for a payload it cannot process.
pub const RETURN_KAPP_ERR: u32 = 6;

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// One simulated device on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDeviceConfig {
  pub port_id: u32,
  #[serde(default)]
  pub kn_number: u32,
  pub product: ProductId,
  pub usb_speed: UsbSpeed,
  #[serde(default = "default_connectable")]
  pub connectable: bool,
  /// Time the device spends on each inference.
  #[serde(default)]
  pub latency_us: u64,
}

fn default_connectable() -> bool {
  true
}

impl SimDeviceConfig {
  pub fn descriptor(&self) -> DeviceDescriptor {
    DeviceDescriptor {
      port_id: self.port_id,
      kn_number: self.kn_number,
      product: self.product,
      usb_speed: self.usb_speed,
      connectable: self.connectable,
    }
  }
}

/// A bus of simulated devices.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
  devices: Vec<SimDeviceConfig>,
}

impl SimBus {
  pub fn new(devices: Vec<SimDeviceConfig>) -> Self {
    Self { devices }
  }
}

impl DeviceProvider for SimBus {
  type Device = SimDevice;

  fn scan(&self) -> Vec<DeviceDescriptor> {
    self.devices.iter().map(SimDeviceConfig::descriptor).collect()
  }

  fn connect(&self, port_id: u32) -> DeviceResult<SimDevice> {
    let config = self
      .devices
      .iter()
      .find(|d| d.port_id == port_id)
      .ok_or(DeviceError::NoDevice(Some(port_id)))?;
    if !config.connectable {
      return Err(DeviceError::NotConnectable(port_id));
    }
    SimDevice::start(config)
  }
}

/// In-process accelerator.
///
/// Requests go through a bounded FIFO of `MAX_QUEUE_NUM` frames to a worker
/// thread, which answers each one with a raw output buffer on an unbounded
/// result channel.
pub struct SimDevice {
  descriptor: DeviceDescriptor,
  timeout_ms: AtomicU64,
  models: Arc<RwLock<Vec<SingleModelDescriptor>>>,
  request_tx: Mutex<Option<SyncSender<Vec<u8>>>>,
  result_rx: Mutex<Receiver<Vec<u8>>>,
  /// Taken on drop.
  worker: Option<JoinHandle<()>>,
}

impl SimDevice {
  pub fn start(config: &SimDeviceConfig) -> DeviceResult<Self> {
    let (request_tx, request_rx) = mpsc::sync_channel(MAX_QUEUE_NUM);
    let (result_tx, result_rx) = mpsc::channel();
    let models = Arc::new(RwLock::new(Vec::new()));

    let worker_models = Arc::clone(&models);
    let latency = Duration::from_micros(config.latency_us);
    let worker = thread::Builder::new()
      .name(format!("sim-npu-{}", config.port_id))
      .spawn(move || run_worker(request_rx, result_tx, worker_models, latency))
      .map_err(|e| {
        warn!("failed to start simulated device worker: {}", e);
        DeviceError::Io(e)
      })?;

    info!(
      "simulated {:?} connected on port {} ({} speed)",
      config.product, config.port_id, config.usb_speed
    );

    Ok(Self {
      descriptor: config.descriptor(),
      timeout_ms: AtomicU64::new(DEFAULT_TIMEOUT_MS),
      models,
      request_tx: Mutex::new(Some(request_tx)),
      result_rx: Mutex::new(result_rx),
      worker: Some(worker),
    })
  }

  pub fn timeout_ms(&self) -> u64 {
    self.timeout_ms.load(Ordering::Relaxed)
  }
}

impl NpuDevice for SimDevice {
  fn descriptor(&self) -> &DeviceDescriptor {
    &self.descriptor
  }

  fn set_timeout(&self, milliseconds: u64) {
    self.timeout_ms.store(milliseconds, Ordering::Relaxed);
  }

  fn load_model(&self, path: &Path) -> DeviceResult<ModelDescriptor> {
    let descriptor = model::load_manifest(path)?;
    if descriptor.target != self.descriptor.product {
      return Err(DeviceError::ModelLoad {
        path: path.to_path_buf(),
        reason: format!(
          "model is built for {:?}, device is {:?}",
          descriptor.target, self.descriptor.product
        ),
      });
    }

    let mut models = self.models.write().map_err(|_| DeviceError::Disconnected)?;
    *models = descriptor.models.clone();
    debug!("loaded {} model(s) from {}", models.len(), path.display());
    Ok(descriptor)
  }

  fn inference_send(&self, request: InferenceRequest) -> DeviceResult<()> {
    let frame = encode_request(&request)?;
    let guard = self.request_tx.lock().map_err(|_| DeviceError::Disconnected)?;
    let tx = guard.as_ref().ok_or(DeviceError::Disconnected)?;
    tx.send(frame).map_err(|_| DeviceError::Disconnected)
  }

  fn inference_receive(&self) -> DeviceResult<InferenceResult> {
    let timeout = self.timeout_ms();
    let rx = self.result_rx.lock().map_err(|_| DeviceError::Disconnected)?;
    let raw = match rx.recv_timeout(Duration::from_millis(timeout)) {
      Ok(raw) => raw,
      Err(RecvTimeoutError::Timeout) => return Err(DeviceError::Timeout(timeout)),
      Err(RecvTimeoutError::Disconnected) => return Err(DeviceError::Disconnected),
    };
    InferenceResult::from_raw(raw)
  }
}

impl Drop for SimDevice {
  fn drop(&mut self) {
    // Closing the request FIFO stops the worker.
    if let Ok(mut tx) = self.request_tx.lock() {
      tx.take();
    }
    if let Some(worker) = self.worker.take() {
      let _ = worker.join();
    }
  }
}

fn run_worker(
  requests: Receiver<Vec<u8>>,
  results: Sender<Vec<u8>>,
  models: Arc<RwLock<Vec<SingleModelDescriptor>>>,
  latency: Duration,
) {
  while let Ok(frame) = requests.recv() {
    let output = match models.read() {
      Ok(models) => process_frame(&frame, &models),
      Err(_) => break,
    };
    if !latency.is_zero() {
      thread::sleep(latency);
    }
    if results.send(output).is_err() {
      break;
    }
  }
  debug!("simulated device worker stopped");
}

/// Answer one request frame with a raw output buffer.
fn process_frame(frame: &[u8], models: &[SingleModelDescriptor]) -> Vec<u8> {
  let desc = match SendDescriptor::from_bytes(frame) {
    Ok(desc) => desc,
    Err(_) => return encode_error_output(0, RETURN_INVALID_DESCRIPTOR_TYPE),
  };
  if desc.desc_type != DESC_TYPE_USER {
    return encode_error_output(desc.request_id, RETURN_INVALID_DESCRIPTOR_TYPE);
  }

  let model = match models.iter().find(|m| desc.model_count > 0 && m.id == desc.model_ids[0]) {
    Some(model) => model,
    None => return encode_error_output(desc.request_id, RETURN_INVALID_MODEL_ID),
  };

  let payload = &frame[SendDescriptor::SIZE.min(frame.len())..];
  if payload.len() != desc.image_size() {
    return encode_error_output(desc.request_id, RETURN_KAPP_ERR);
  }
  let fits = desc.image.width == model.width && desc.image.height == model.height;
  if desc.resize == resize_code(ResizeMode::Disable) && !fits {
    return encode_error_output(desc.request_id, RETURN_KAPP_ERR);
  }

  let seed = payload
    .iter()
    .step_by(61)
    .fold(desc.request_id, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u32));

  let data: Vec<Vec<i8>> = model
    .outputs
    .iter()
    .enumerate()
    .map(|(n, node)| {
      let len = node.width as usize * node.height as usize * node.channel as usize;
      (0..len)
        .map(|i| (seed.wrapping_add((i * 13 + n * 7) as u32) % 256) as u8 as i8)
        .collect()
    })
    .collect();

  encode_raw_output(desc.request_id, &model.outputs, &data)
    .unwrap_or_else(|_| encode_error_output(desc.request_id, RETURN_KAPP_ERR))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::input::{ImageFormat, InputImage, InputOptions};
  use crate::model::OutputNodeShape;

  fn sim_config(port_id: u32) -> SimDeviceConfig {
    SimDeviceConfig {
      port_id,
      kn_number: 0x1234,
      product: ProductId::Kl720,
      usb_speed: UsbSpeed::Super,
      connectable: true,
      latency_us: 0,
    }
  }

  fn tiny_model() -> SingleModelDescriptor {
    SingleModelDescriptor {
      id: 7,
      name: "tiny".to_string(),
      width: 8,
      height: 8,
      channel: 3,
      image_format: ImageFormat::Rgb565,
      outputs: vec![OutputNodeShape {
        width: 3,
        height: 2,
        channel: 2,
        radix: 0,
        scale: 1.0,
      }],
    }
  }

  fn request(sequence: u32, model_id: u32, size: u32, resize: ResizeMode) -> InferenceRequest {
    InferenceRequest {
      sequence,
      model_id,
      image: InputImage::test_pattern(size, size, ImageFormat::Rgb565).unwrap(),
      options: InputOptions {
        resize,
        ..InputOptions::default()
      },
    }
  }

  #[test]
  fn test_scan_and_connect() {
    let mut closed = sim_config(2);
    closed.connectable = false;
    let bus = SimBus::new(vec![sim_config(1), closed]);

    assert_eq!(bus.scan().len(), 2);
    assert!(bus.connect(1).is_ok());
    assert!(matches!(bus.connect(2), Err(DeviceError::NotConnectable(2))));
    assert!(matches!(bus.connect(9), Err(DeviceError::NoDevice(Some(9)))));
  }

  #[test]
  fn test_results_in_submission_order() {
    let device = SimDevice::start(&sim_config(0)).unwrap();
    *device.models.write().unwrap() = vec![tiny_model()];

    for seq in 0..3 {
      device.inference_send(request(seq, 7, 8, ResizeMode::Enable)).unwrap();
    }
    for seq in 0..3 {
      let result = device.inference_receive().unwrap();
      assert_eq!(result.sequence(), seq);
      assert_eq!(result.num_output_node(), 1);
    }
  }

  #[test]
  fn test_unknown_model_is_firmware_error() {
    let device = SimDevice::start(&sim_config(0)).unwrap();
    device.inference_send(request(0, 99, 8, ResizeMode::Enable)).unwrap();
    let err = device.inference_receive().unwrap_err();
    assert!(matches!(err, DeviceError::Firmware(RETURN_INVALID_MODEL_ID)));
  }

  #[test]
  fn test_resize_disabled_needs_exact_shape() {
    let device = SimDevice::start(&sim_config(0)).unwrap();
    *device.models.write().unwrap() = vec![tiny_model()];
    device.inference_send(request(0, 7, 4, ResizeMode::Disable)).unwrap();
    assert!(matches!(device.inference_receive(), Err(DeviceError::Firmware(RETURN_KAPP_ERR))));
  }

  #[test]
  fn test_start_runs_worker() {
    let device = SimDevice::start(&sim_config(4)).unwrap();
    let worker = device.worker.as_ref().unwrap();
    assert_eq!(worker.thread().name(), Some("sim-npu-4"));
    assert!(!worker.is_finished());
  }

  #[test]
  fn test_receive_times_out() {
    let device = SimDevice::start(&sim_config(0)).unwrap();
    device.set_timeout(20);
    assert!(matches!(device.inference_receive(), Err(DeviceError::Timeout(20))));
  }
}
