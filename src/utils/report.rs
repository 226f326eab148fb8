use crate::device::DeviceDescriptor;
use crate::inference::{ChannelOrdering, NodeOutput};
use crate::pipeline::{RunReport, SequenceMismatch};
use crate::{stage, stage_info};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
  pub index: usize,
  pub width: u32,
  pub height: u32,
  pub channel: u32,
  pub ordering: ChannelOrdering,
  pub num_data: usize,
  pub min: f32,
  pub max: f32,
  pub mean: f32,
}

impl NodeSummary {
  pub fn new(index: usize, node: &NodeOutput) -> Self {
    let (min, max, sum) = node
      .data
      .iter()
      .fold((f32::INFINITY, f32::NEG_INFINITY, 0.0f64), |(lo, hi, sum), &v| {
        (lo.min(v), hi.max(v), sum + v as f64)
      });
    let mean = if node.data.is_empty() {
      0.0
    } else {
      (sum / node.data.len() as f64) as f32
    };
    let (min, max) = if node.data.is_empty() { (0.0, 0.0) } else { (min, max) };

    Self {
      index,
      width: node.width,
      height: node.height,
      channel: node.channel,
      ordering: node.ordering,
      num_data: node.num_data(),
      min,
      max,
      mean,
    }
  }
}

/// What gets written to the JSON report.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
  pub loop_count: u32,
  pub elapsed_secs: f64,
  pub fps: Option<f64>,
  pub final_sequence: u32,
  pub mismatches: Vec<SequenceMismatch>,
  pub reordered: u32,
  pub missing: Vec<u32>,
  pub duplicates: Vec<u32>,
  pub nodes: Vec<NodeSummary>,
}

impl RunSummary {
  pub fn new(report: &RunReport) -> Self {
    Self {
      loop_count: report.loop_count,
      elapsed_secs: report.elapsed.as_secs_f64(),
      fps: report.fps(),
      final_sequence: report.final_result.sequence(),
      mismatches: report.collect.mismatches.clone(),
      reordered: report.collect.reordered,
      missing: report.collect.missing.clone(),
      duplicates: report.collect.duplicates.clone(),
      nodes: report.nodes.iter().enumerate().map(|(i, n)| NodeSummary::new(i, n)).collect(),
    }
  }
}

pub fn print_devices(devices: &[DeviceDescriptor]) {
  stage!("Scan Devices");
  if devices.is_empty() {
    stage_info!("no device found");
    return;
  }
  for d in devices {
    stage_info!(
      "port {}: {:?} kn {:#x}, {} speed{}",
      d.port_id,
      d.product,
      d.kn_number,
      d.usb_speed,
      if d.connectable { "" } else { ", not connectable" }
    );
  }
}

/// Throughput block printed after the pipeline finishes.
pub fn print_run_report(report: &RunReport) {
  stage!("Result");
  stage_info!("Total inference {} images", report.loop_count);
  match report.fps() {
    Some(fps) => stage_info!(
      "Time spent: {:.2} secs, FPS = {:.1}",
      report.elapsed.as_secs_f64(),
      fps
    ),
    None => stage_info!("Time spent: {:.2} secs", report.elapsed.as_secs_f64()),
  }

  let collect = &report.collect;
  if !collect.mismatches.is_empty() {
    stage_info!("{} frame(s) arrived with an unexpected inference number", collect.mismatches.len());
  }
  if collect.reordered > 0 {
    stage_info!("{} frame(s) arrived out of order", collect.reordered);
  }
  if !collect.missing.is_empty() || !collect.duplicates.is_empty() {
    stage_info!(
      "missing inference numbers: {:?}, duplicates: {:?}",
      collect.missing,
      collect.duplicates
    );
  }
}

pub fn print_node_outputs(nodes: &[NodeOutput]) {
  stage!("Retrieve Inference Node Output");
  for (i, node) in nodes.iter().enumerate() {
    let s = NodeSummary::new(i, node);
    stage_info!(
      "node {}: {}x{}x{} ({:?}), {} values, min {:.3} max {:.3} mean {:.3}",
      s.index,
      s.width,
      s.height,
      s.channel,
      s.ordering,
      s.num_data,
      s.min,
      s.max,
      s.mean
    );
  }
}

pub fn write_json_report(path: &Path, report: &RunReport) -> io::Result<()> {
  let json = serde_json::to_string_pretty(&RunSummary::new(report)).map_err(io::Error::other)?;
  fs::write(path, json)
}
