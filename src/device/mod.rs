pub mod protocol;
pub mod sim;

use crate::error::DeviceResult;
use crate::inference::{InferenceRequest, InferenceResult};
use crate::model::ModelDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub use sim::{SimBus, SimDevice};

/// USB link speed class, ordered from slowest to fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbSpeed {
  Unknown,
  Low,
  Full,
  High,
  Super,
}

impl fmt::Display for UsbSpeed {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      UsbSpeed::Unknown => "unknown",
      UsbSpeed::Low => "low",
      UsbSpeed::Full => "full",
      UsbSpeed::High => "high",
      UsbSpeed::Super => "super",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductId {
  Kl520,
  Kl720,
}

/// What a bus scan reports about one attached device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
  pub port_id: u32,
  pub kn_number: u32,
  pub product: ProductId,
  pub usb_speed: UsbSpeed,
  pub connectable: bool,
}

/// A connected accelerator.
///
/// All methods take `&self`: one handle is shared by the submitter and the
/// collector, so implementations keep their own locking.
pub trait NpuDevice: Send + Sync {
  fn descriptor(&self) -> &DeviceDescriptor;

  fn usb_speed(&self) -> UsbSpeed {
    self.descriptor().usb_speed
  }

  /// Set the timeout used by every later transfer.
  fn set_timeout(&self, milliseconds: u64);

  fn load_model(&self, path: &Path) -> DeviceResult<ModelDescriptor>;

  /// Queue one inference. May block while the device queue is full.
  fn inference_send(&self, request: InferenceRequest) -> DeviceResult<()>;

  /// Block until the next inference result is available.
  fn inference_receive(&self) -> DeviceResult<InferenceResult>;
}

/// Discovery and connection for a family of devices.
pub trait DeviceProvider {
  type Device: NpuDevice;

  fn scan(&self) -> Vec<DeviceDescriptor>;

  fn connect(&self, port_id: u32) -> DeviceResult<Self::Device>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_usb_speed_ordering() {
    assert!(UsbSpeed::Super > UsbSpeed::High);
    assert!(UsbSpeed::High > UsbSpeed::Full);
    assert!(UsbSpeed::Unknown < UsbSpeed::Low);
    assert_eq!(UsbSpeed::High.to_string(), "high");
  }
}
