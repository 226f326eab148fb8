use super::{CancelToken, InferenceJob};
use crate::device::NpuDevice;
use crate::error::{PipelineError, Result};
use log::{error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmitStats {
  pub submitted: u32,
}

/// Send `job.loop_count` requests tagged `0..loop_count`.
///
/// Stops at the first failed send, so a failure at frame `i` leaves exactly
/// `i` submitted requests.
pub fn run_submitter<D: NpuDevice + ?Sized>(device: &D, job: &InferenceJob, cancel: &CancelToken) -> Result<SubmitStats> {
  let mut stats = SubmitStats::default();

  for sequence in 0..job.loop_count {
    if cancel.is_cancelled() {
      return Err(PipelineError::Interrupted { completed: stats.submitted });
    }

    device.inference_send(job.request(sequence)).map_err(|source| {
      error!("inference send failed at frame {}: {}", sequence, source);
      PipelineError::Submit { sequence, source }
    })?;
    stats.submitted += 1;
    trace!("submitted frame {}", sequence);
  }

  Ok(stats)
}
