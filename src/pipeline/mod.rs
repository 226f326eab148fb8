//! Two-thread streaming pipeline: a submitter feeding the device and a
//! collector draining it, run side by side by the coordinator.

pub mod cancel;
pub mod collector;
pub mod coordinator;
pub mod handoff;
pub mod submitter;

use crate::inference::{ChannelOrdering, InferenceRequest};
use crate::input::{InputImage, InputOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use cancel::CancelToken;
pub use collector::{run_collector, CollectStats, SequenceMismatch};
pub use coordinator::{throughput, Coordinator, PipelineState, RunReport};
pub use handoff::{handoff, HandoffReceiver, HandoffSender};
pub use submitter::{run_submitter, SubmitStats};

/// How the collector treats a result whose sequence number is not the one
/// expected at its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceCheck {
  /// Expect strict submission order; warn once per mismatching position.
  Strict,
  /// Accept any arrival order; report only missing and duplicate numbers.
  Reorder,
}

/// What to stream: one model, one image, `loop_count` times.
#[derive(Debug, Clone)]
pub struct InferenceJob {
  pub model_id: u32,
  pub image: InputImage,
  pub options: InputOptions,
  pub loop_count: u32,
}

impl InferenceJob {
  pub fn request(&self, sequence: u32) -> InferenceRequest {
    InferenceRequest {
      sequence,
      model_id: self.model_id,
      image: self.image.clone(),
      options: self.options,
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
  pub handoff_timeout: Duration,
  pub sequence_check: SequenceCheck,
  pub ordering: ChannelOrdering,
  pub progress: bool,
}

impl Default for PipelineOptions {
  fn default() -> Self {
    Self {
      handoff_timeout: Duration::from_secs(3),
      sequence_check: SequenceCheck::Strict,
      ordering: ChannelOrdering::Chw,
      progress: false,
    }
  }
}
