use crate::device::UsbSpeed;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by an `NpuDevice` or a `DeviceProvider`.
#[derive(Debug, Error)]
pub enum DeviceError {
  #[error("no device found at port {0:?}")]
  NoDevice(Option<u32>),

  #[error("device at port {0} is not connectable")]
  NotConnectable(u32),

  #[error("device is running at {actual} speed, {required} is required")]
  UsbSpeedTooLow { actual: UsbSpeed, required: UsbSpeed },

  #[error("device communication timed out after {0} ms")]
  Timeout(u64),

  #[error("device disconnected")]
  Disconnected,

  #[error("invalid parameter: {0}")]
  InvalidParam(String),

  #[error("image payload of {size} bytes exceeds the device buffer of {limit} bytes")]
  SendDataTooLarge { size: usize, limit: usize },

  #[error("load model {path:?} failed: {reason}")]
  ModelLoad { path: PathBuf, reason: String },

  #[error("device firmware returned error code {0}")]
  Firmware(u32),

  #[error("malformed raw output: {0}")]
  MalformedOutput(String),

  #[error(transparent)]
  Io(#[from] io::Error),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors produced while loading and validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("cannot read config file {path:?}: {source}")]
  Read { path: PathBuf, source: io::Error },

  #[error("parse TOML config failed: {0}")]
  Parse(#[from] toml::de::Error),

  #[error("invalid config: {0}")]
  Invalid(String),
}

/// Fatal error classes of a streaming run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
  /// Bad port, link speed too low, connect failure.
  Connectivity,
  /// Model upload, inference send or receive failed.
  Communication,
  /// Final result never arrived in the handoff.
  Handoff,
  /// Run stopped by an interrupt.
  Interrupted,
  /// Configuration, image input, or an internal failure.
  Setup,
}

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("connect device failed: {0}")]
  Connect(#[source] DeviceError),

  #[error("upload model failed: {0}")]
  ModelUpload(#[source] DeviceError),

  #[error("inference send failed at frame {sequence}: {source}")]
  Submit { sequence: u32, source: DeviceError },

  #[error("inference receive failed at frame {sequence}: {source}")]
  Receive { sequence: u32, source: DeviceError },

  #[error("result handoff is empty after {0:?}")]
  HandoffTimeout(Duration),

  #[error("interrupted after {completed} frames")]
  Interrupted { completed: u32 },

  #[error("retrieve node output failed: {0}")]
  Retrieve(#[source] DeviceError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("prepare image failed: {0}")]
  Image(String),

  #[error("{0} thread panicked")]
  WorkerPanicked(&'static str),

  #[error(transparent)]
  Io(#[from] io::Error),
}

impl PipelineError {
  pub fn category(&self) -> ErrorCategory {
    match self {
      PipelineError::Connect(_) => ErrorCategory::Connectivity,
      PipelineError::ModelUpload(_)
      | PipelineError::Submit { .. }
      | PipelineError::Receive { .. }
      | PipelineError::Retrieve(_) => ErrorCategory::Communication,
      PipelineError::HandoffTimeout(_) => ErrorCategory::Handoff,
      PipelineError::Interrupted { .. } => ErrorCategory::Interrupted,
      PipelineError::Config(_)
      | PipelineError::Image(_)
      | PipelineError::WorkerPanicked(_)
      | PipelineError::Io(_) => ErrorCategory::Setup,
    }
  }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_categories() {
    let err = PipelineError::Connect(DeviceError::NoDevice(Some(3)));
    assert_eq!(err.category(), ErrorCategory::Connectivity);

    let err = PipelineError::Submit {
      sequence: 4,
      source: DeviceError::Timeout(5000),
    };
    assert_eq!(err.category(), ErrorCategory::Communication);
    assert_eq!(err.to_string(), "inference send failed at frame 4: device communication timed out after 5000 ms");

    let err = PipelineError::HandoffTimeout(Duration::from_secs(3));
    assert_eq!(err.category(), ErrorCategory::Handoff);
  }
}
