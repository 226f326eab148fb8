//! Device setup: pick a port, check the link, connect, upload the model.

use crate::device::{DeviceDescriptor, DeviceProvider, NpuDevice, UsbSpeed};
use crate::error::{DeviceError, DeviceResult, PipelineError, Result};
use crate::model::{ModelDescriptor, SingleModelDescriptor};
use log::{debug, info};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectSettings {
  /// `None` picks the first connectable device.
  pub port_id: Option<u32>,
  pub min_usb_speed: UsbSpeed,
  pub timeout_ms: u64,
}

/// Choose the device to open from a scan.
pub fn select_device(scanned: &[DeviceDescriptor], port_id: Option<u32>) -> DeviceResult<&DeviceDescriptor> {
  match port_id {
    Some(port) => {
      let device = scanned
        .iter()
        .find(|d| d.port_id == port)
        .ok_or(DeviceError::NoDevice(Some(port)))?;
      if !device.connectable {
        return Err(DeviceError::NotConnectable(port));
      }
      Ok(device)
    }
    None => scanned
      .iter()
      .find(|d| d.connectable)
      .ok_or(DeviceError::NoDevice(None)),
  }
}

/// A connected device and, once uploaded, its models.
///
/// Both are set up here once and only borrowed by the pipeline.
pub struct Session<D: NpuDevice> {
  device: D,
  models: Option<ModelDescriptor>,
}

impl<D: NpuDevice> Session<D> {
  pub fn connect<P>(provider: &P, settings: &ConnectSettings) -> Result<Self>
  where
    P: DeviceProvider<Device = D>,
  {
    let scanned = provider.scan();
    debug!("scan found {} device(s)", scanned.len());

    let target = select_device(&scanned, settings.port_id).map_err(PipelineError::Connect)?;
    if target.usb_speed < settings.min_usb_speed {
      return Err(PipelineError::Connect(DeviceError::UsbSpeedTooLow {
        actual: target.usb_speed,
        required: settings.min_usb_speed,
      }));
    }

    let device = provider.connect(target.port_id).map_err(PipelineError::Connect)?;
    device.set_timeout(settings.timeout_ms);
    info!(
      "connected {:?} at port {} (kn {:#x}, {} speed)",
      target.product, target.port_id, target.kn_number, target.usb_speed
    );

    Ok(Self { device, models: None })
  }

  pub fn load_model(&mut self, path: &Path) -> Result<&ModelDescriptor> {
    let models = self.device.load_model(path).map_err(PipelineError::ModelUpload)?;
    info!("uploaded {} model(s) from {}", models.models.len(), path.display());
    Ok(self.models.insert(models))
  }

  pub fn device(&self) -> &D {
    &self.device
  }

  pub fn models(&self) -> Option<&ModelDescriptor> {
    self.models.as_ref()
  }

  /// The model at `index` of the uploaded list.
  pub fn model(&self, index: usize) -> Result<&SingleModelDescriptor> {
    let models = self.models.as_ref().ok_or_else(|| {
      PipelineError::ModelUpload(DeviceError::InvalidParam("no model uploaded".to_string()))
    })?;
    models.models.get(index).ok_or_else(|| {
      PipelineError::ModelUpload(DeviceError::InvalidParam(format!(
        "model index {} out of range, {} model(s) uploaded",
        index,
        models.models.len()
      )))
    })
  }
}
