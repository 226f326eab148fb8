use super::{
  handoff, run_collector, run_submitter, CancelToken, CollectStats, InferenceJob, PipelineOptions, SubmitStats,
};
use crate::device::NpuDevice;
use crate::error::{ConfigError, PipelineError, Result};
use crate::inference::{InferenceResult, NodeOutput};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
  Idle = 0,
  Running = 1,
  Completed = 2,
  Aborted = 3,
}

impl PipelineState {
  fn from_u8(value: u8) -> Self {
    match value {
      1 => PipelineState::Running,
      2 => PipelineState::Completed,
      3 => PipelineState::Aborted,
      _ => PipelineState::Idle,
    }
  }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
  pub loop_count: u32,
  pub elapsed: Duration,
  pub submit: SubmitStats,
  pub collect: CollectStats,
  pub final_result: InferenceResult,
  pub nodes: Vec<NodeOutput>,
}

impl RunReport {
  pub fn fps(&self) -> Option<f64> {
    throughput(self.loop_count, self.elapsed)
  }
}

/// Frames per second, `None` when no time was measured.
pub fn throughput(frames: u32, elapsed: Duration) -> Option<f64> {
  let secs = elapsed.as_secs_f64();
  if secs > 0.0 {
    Some(frames as f64 / secs)
  } else {
    None
  }
}

/// Runs the submitter and collector of one job against a shared device.
pub struct Coordinator<'a, D: NpuDevice + ?Sized> {
  device: &'a D,
  options: PipelineOptions,
  state: AtomicU8,
}

impl<'a, D: NpuDevice + ?Sized> Coordinator<'a, D> {
  pub fn new(device: &'a D, options: PipelineOptions) -> Self {
    Self {
      device,
      options,
      state: AtomicU8::new(PipelineState::Idle as u8),
    }
  }

  pub fn state(&self) -> PipelineState {
    PipelineState::from_u8(self.state.load(Ordering::SeqCst))
  }

  fn set_state(&self, state: PipelineState) {
    self.state.store(state as u8, Ordering::SeqCst);
  }

  /// Stream `job` through the device and wait for both tasks.
  ///
  /// The clock covers the first submission up to the last collected result.
  /// A failing task cancels the other one; a send error takes precedence over
  /// a receive error, which takes precedence over an interrupt.
  pub fn run(&self, job: &InferenceJob, cancel: &CancelToken) -> Result<RunReport> {
    if job.loop_count == 0 {
      return Err(ConfigError::Invalid("loop count must be at least 1".to_string()).into());
    }

    self.set_state(PipelineState::Running);
    let outcome = self.run_tasks(job, cancel);
    match &outcome {
      Ok(report) => {
        self.set_state(PipelineState::Completed);
        info!("{} frames in {:.3}s", report.loop_count, report.elapsed.as_secs_f64());
      }
      Err(e) => {
        self.set_state(PipelineState::Aborted);
        warn!("pipeline aborted: {}", e);
      }
    }
    outcome
  }

  fn run_tasks(&self, job: &InferenceJob, cancel: &CancelToken) -> Result<RunReport> {
    let (tx, rx) = handoff::<InferenceResult>();
    let options = self.options;
    let device = self.device;

    let start = Instant::now();
    let (submitted, collected) = thread::scope(|s| -> std::io::Result<_> {
      let submitter = thread::Builder::new()
        .name("npu-submit".to_string())
        .spawn_scoped(s, || {
          let outcome = run_submitter(device, job, cancel);
          if outcome.is_err() {
            cancel.cancel();
          }
          outcome
        })?;

      let collector = thread::Builder::new()
        .name("npu-collect".to_string())
        .spawn_scoped(s, move || {
          let outcome = run_collector(
            device,
            job.loop_count,
            options.sequence_check,
            options.progress,
            cancel,
            tx,
          );
          if outcome.is_err() {
            cancel.cancel();
          }
          outcome
        })
        .map_err(|e| {
          cancel.cancel();
          e
        })?;

      Ok((submitter.join(), collector.join()))
    })?;
    let elapsed = start.elapsed();

    let submitted = submitted.map_err(|_| PipelineError::WorkerPanicked("submitter"))?;
    let collected = collected.map_err(|_| PipelineError::WorkerPanicked("collector"))?;
    let (submit, collect) = match (submitted, collected) {
      (Ok(submit), Ok(collect)) => (submit, collect),
      (Err(e @ PipelineError::Submit { .. }), _) | (_, Err(e @ PipelineError::Receive { .. })) => return Err(e),
      (_, Err(e)) | (Err(e), _) => return Err(e),
    };
    debug!("submitted {} frames, collected {}", submit.submitted, collect.received);

    let final_result = rx
      .get_timeout(options.handoff_timeout)
      .ok_or(PipelineError::HandoffTimeout(options.handoff_timeout))?;
    let nodes = final_result
      .retrieve_all_nodes(options.ordering)
      .map_err(PipelineError::Retrieve)?;

    Ok(RunReport {
      loop_count: job.loop_count,
      elapsed,
      submit,
      collect,
      final_result,
      nodes,
    })
  }
}
