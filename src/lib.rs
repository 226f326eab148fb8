//! Streaming inference host for NPU accelerators.
//!
//! A session connects one device and uploads a model; the pipeline then
//! streams a single image through it with a submitter and a collector
//! thread, and extracts float tensors from the final result.

pub mod config;
pub mod device;
pub mod error;
pub mod inference;
pub mod input;
pub mod model;
pub mod pipeline;
pub mod session;
pub mod utils;

pub use device::{DeviceProvider, NpuDevice};
pub use error::{DeviceError, ErrorCategory, PipelineError};
pub use pipeline::{CancelToken, Coordinator, InferenceJob, PipelineOptions};
pub use session::Session;
