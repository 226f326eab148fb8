use super::{CancelToken, HandoffSender, SequenceCheck};
use crate::device::NpuDevice;
use crate::error::{PipelineError, Result};
use crate::inference::InferenceResult;
use log::{debug, error, trace, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// A result that arrived at `position` carrying another sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceMismatch {
  pub position: u32,
  pub received: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectStats {
  pub received: u32,
  /// Strict check: every position whose sequence number was off.
  pub mismatches: Vec<SequenceMismatch>,
  /// Reorder check: results that arrived out of position.
  pub reordered: u32,
  /// Reorder check: sequence numbers never seen.
  pub missing: Vec<u32>,
  /// Reorder check: sequence numbers seen more than once, or out of range.
  pub duplicates: Vec<u32>,
}

struct SequenceTracker {
  check: SequenceCheck,
  loop_count: u32,
  /// sequence number -> position it arrived at
  arrivals: BTreeMap<u32, u32>,
}

impl SequenceTracker {
  fn new(check: SequenceCheck, loop_count: u32) -> Self {
    Self {
      check,
      loop_count,
      arrivals: BTreeMap::new(),
    }
  }

  fn observe(&mut self, position: u32, received: u32, stats: &mut CollectStats) {
    match self.check {
      SequenceCheck::Strict => {
        if received != position {
          warn!("incorrect inference number {} at frame {}", received, position);
          stats.mismatches.push(SequenceMismatch { position, received });
        }
      }
      SequenceCheck::Reorder => {
        if received >= self.loop_count || self.arrivals.contains_key(&received) {
          warn!("duplicate or unknown inference number {} at frame {}", received, position);
          stats.duplicates.push(received);
          return;
        }
        self.arrivals.insert(received, position);
        if received != position {
          debug!("inference number {} arrived at frame {}", received, position);
          stats.reordered += 1;
        }
      }
    }
  }

  fn finish(&self, stats: &mut CollectStats) {
    if self.check != SequenceCheck::Reorder {
      return;
    }
    stats.missing = (0..self.loop_count).filter(|s| !self.arrivals.contains_key(s)).collect();
    if !stats.missing.is_empty() {
      warn!("{} inference number(s) never arrived", stats.missing.len());
    }
  }
}

/// Receive `loop_count` results, check their sequence numbers, and put the
/// last one into `handoff`.
///
/// The handoff is left empty when the run stops early.
pub fn run_collector<D: NpuDevice + ?Sized>(
  device: &D,
  loop_count: u32,
  check: SequenceCheck,
  progress: bool,
  cancel: &CancelToken,
  handoff: HandoffSender<InferenceResult>,
) -> Result<CollectStats> {
  let mut stats = CollectStats::default();
  let mut tracker = SequenceTracker::new(check, loop_count);
  let mut last = None;

  for position in 0..loop_count {
    if cancel.is_cancelled() {
      return Err(PipelineError::Interrupted { completed: stats.received });
    }

    let result = device.inference_receive().map_err(|source| {
      error!("inference receive failed at frame {}: {}", position, source);
      PipelineError::Receive { sequence: position, source }
    })?;
    stats.received += 1;
    tracker.observe(position, result.sequence(), &mut stats);
    trace!("received frame {} (inference number {})", position, result.sequence());

    if progress {
      print!(".");
      let _ = io::stdout().flush();
    }
    last = Some(result);
  }

  if progress && loop_count > 0 {
    println!();
  }
  tracker.finish(&mut stats);

  if let Some(result) = last {
    handoff.put(result);
  }
  Ok(stats)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn observe_all(check: SequenceCheck, arrivals: &[u32]) -> CollectStats {
    let mut stats = CollectStats::default();
    let mut tracker = SequenceTracker::new(check, arrivals.len() as u32);
    for (position, &received) in arrivals.iter().enumerate() {
      tracker.observe(position as u32, received, &mut stats);
    }
    tracker.finish(&mut stats);
    stats
  }

  #[test]
  fn test_strict_records_each_position() {
    let stats = observe_all(SequenceCheck::Strict, &[0, 2, 1, 3]);
    assert_eq!(
      stats.mismatches,
      vec![
        SequenceMismatch { position: 1, received: 2 },
        SequenceMismatch { position: 2, received: 1 },
      ]
    );
    assert!(stats.missing.is_empty());
  }

  #[test]
  fn test_reorder_accepts_permutation() {
    let stats = observe_all(SequenceCheck::Reorder, &[1, 0, 2, 3]);
    assert!(stats.mismatches.is_empty());
    assert_eq!(stats.reordered, 2);
    assert!(stats.missing.is_empty());
    assert!(stats.duplicates.is_empty());
  }

  #[test]
  fn test_reorder_reports_missing_and_duplicate() {
    let stats = observe_all(SequenceCheck::Reorder, &[0, 1, 1, 7]);
    assert_eq!(stats.duplicates, vec![1, 7]);
    assert_eq!(stats.missing, vec![2, 3]);
  }
}
