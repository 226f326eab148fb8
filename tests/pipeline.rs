use log::{Level, LevelFilter, Log, Metadata, Record};
use npustream::device::protocol::encode_raw_output;
use npustream::device::{DeviceDescriptor, NpuDevice, ProductId, UsbSpeed};
use npustream::error::{DeviceError, DeviceResult, ErrorCategory, PipelineError};
use npustream::inference::{ChannelOrdering, InferenceRequest, InferenceResult};
use npustream::input::{ImageFormat, InputImage, InputOptions};
use npustream::model::{ModelDescriptor, OutputNodeShape};
use npustream::pipeline::{
  CancelToken, Coordinator, InferenceJob, PipelineOptions, PipelineState, SequenceCheck, SequenceMismatch,
};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

const NODE: OutputNodeShape = OutputNodeShape {
  width: 4,
  height: 2,
  channel: 3,
  radix: 0,
  scale: 1.0,
};

/// Echoes each submitted sequence number back through an in-memory queue.
struct MockDevice {
  descriptor: DeviceDescriptor,
  sent: Mutex<Vec<u32>>,
  queue_tx: Mutex<Sender<u32>>,
  queue_rx: Mutex<Receiver<u32>>,
  receives: AtomicU32,
  last_raw: Mutex<Option<Vec<u8>>>,
  fail_send_at: Option<u32>,
  fail_receive_at: Option<u32>,
  remap: fn(u32) -> u32,
  receive_delay: Duration,
}

impl MockDevice {
  fn new() -> Self {
    let (tx, rx) = mpsc::channel();
    Self {
      descriptor: DeviceDescriptor {
        port_id: 1,
        kn_number: 0xabcd,
        product: ProductId::Kl720,
        usb_speed: UsbSpeed::Super,
        connectable: true,
      },
      sent: Mutex::new(Vec::new()),
      queue_tx: Mutex::new(tx),
      queue_rx: Mutex::new(rx),
      receives: AtomicU32::new(0),
      last_raw: Mutex::new(None),
      fail_send_at: None,
      fail_receive_at: None,
      remap: |seq| seq,
      receive_delay: Duration::ZERO,
    }
  }

  fn sent(&self) -> Vec<u32> {
    self.sent.lock().unwrap().clone()
  }
}

impl NpuDevice for MockDevice {
  fn descriptor(&self) -> &DeviceDescriptor {
    &self.descriptor
  }

  fn set_timeout(&self, _milliseconds: u64) {}

  fn load_model(&self, path: &Path) -> DeviceResult<ModelDescriptor> {
    Err(DeviceError::ModelLoad {
      path: path.to_path_buf(),
      reason: "mock device".to_string(),
    })
  }

  fn inference_send(&self, request: InferenceRequest) -> DeviceResult<()> {
    if self.fail_send_at == Some(request.sequence) {
      return Err(DeviceError::Disconnected);
    }
    self.sent.lock().unwrap().push(request.sequence);
    self.queue_tx.lock().unwrap().send(request.sequence).unwrap();
    Ok(())
  }

  fn inference_receive(&self) -> DeviceResult<InferenceResult> {
    let position = self.receives.fetch_add(1, Ordering::SeqCst);
    if self.fail_receive_at == Some(position) {
      return Err(DeviceError::Timeout(5000));
    }
    if !self.receive_delay.is_zero() {
      thread::sleep(self.receive_delay);
    }

    let sequence = self
      .queue_rx
      .lock()
      .unwrap()
      .recv_timeout(Duration::from_millis(500))
      .map_err(|_| DeviceError::Timeout(500))?;
    let sequence = (self.remap)(sequence);

    let values: Vec<i8> = (0..24).map(|i| ((sequence as usize + i) % 100) as i8).collect();
    let raw = encode_raw_output(sequence, &[NODE], &[values])?;
    *self.last_raw.lock().unwrap() = Some(raw.clone());
    InferenceResult::from_raw(raw)
  }
}

/// Keeps every warning logged by the tests in this binary.
struct WarningLog;

static WARNINGS: Mutex<Vec<String>> = Mutex::new(Vec::new());
static WARNING_LOG: WarningLog = WarningLog;

impl Log for WarningLog {
  fn enabled(&self, metadata: &Metadata) -> bool {
    metadata.level() <= Level::Warn
  }

  fn log(&self, record: &Record) {
    if self.enabled(record.metadata()) {
      WARNINGS.lock().unwrap().push(record.args().to_string());
    }
  }

  fn flush(&self) {}
}

fn capture_warnings() {
  if log::set_logger(&WARNING_LOG).is_ok() {
    log::set_max_level(LevelFilter::Warn);
  }
}

fn warnings_containing(needle: &str) -> usize {
  WARNINGS.lock().unwrap().iter().filter(|w| w.contains(needle)).count()
}

fn job(loop_count: u32) -> InferenceJob {
  InferenceJob {
    model_id: 211,
    image: InputImage::test_pattern(16, 16, ImageFormat::Rgb565).unwrap(),
    options: InputOptions::default(),
    loop_count,
  }
}

fn options(sequence_check: SequenceCheck) -> PipelineOptions {
  PipelineOptions {
    handoff_timeout: Duration::from_secs(1),
    sequence_check,
    ordering: ChannelOrdering::Hcw,
    progress: false,
  }
}

#[test]
fn test_submits_in_order_and_collects_all() {
  let device = MockDevice::new();
  let coordinator = Coordinator::new(&device, options(SequenceCheck::Strict));
  assert_eq!(coordinator.state(), PipelineState::Idle);

  let report = coordinator.run(&job(20), &CancelToken::new()).unwrap();

  assert_eq!(device.sent(), (0..20).collect::<Vec<_>>());
  assert_eq!(device.receives.load(Ordering::SeqCst), 20);
  assert_eq!(report.submit.submitted, 20);
  assert_eq!(report.collect.received, 20);
  assert!(report.collect.mismatches.is_empty());
  assert_eq!(coordinator.state(), PipelineState::Completed);
  if !report.elapsed.is_zero() {
    assert!(report.fps().unwrap() > 0.0);
  }
}

#[test]
fn test_final_result_is_last_receive() {
  let device = MockDevice::new();
  let report = Coordinator::new(&device, options(SequenceCheck::Strict))
    .run(&job(8), &CancelToken::new())
    .unwrap();

  assert_eq!(report.final_result.sequence(), 7);
  assert_eq!(Some(report.final_result.raw().to_vec()), *device.last_raw.lock().unwrap());
  assert_eq!(report.nodes.len(), 1);
  assert_eq!(report.nodes[0].num_data(), 24);
  assert_eq!(report.nodes[0].data[0], 7.0);
}

#[test]
fn test_single_mismatch_is_recorded() {
  capture_warnings();
  let mut device = MockDevice::new();
  device.remap = |seq| if seq == 5 { 1005 } else { seq };

  let report = Coordinator::new(&device, options(SequenceCheck::Strict))
    .run(&job(10), &CancelToken::new())
    .unwrap();

  assert_eq!(
    report.collect.mismatches,
    vec![SequenceMismatch {
      position: 5,
      received: 1005
    }]
  );
  assert_eq!(report.collect.received, 10);
  assert_eq!(warnings_containing("inference number 1005 at frame 5"), 1);
  assert_eq!(warnings_containing("incorrect inference number"), 1);
}

#[test]
fn test_reorder_policy_accepts_swapped_pairs() {
  let mut device = MockDevice::new();
  device.remap = |seq| seq ^ 1;

  let report = Coordinator::new(&device, options(SequenceCheck::Reorder))
    .run(&job(10), &CancelToken::new())
    .unwrap();

  assert!(report.collect.mismatches.is_empty());
  assert_eq!(report.collect.reordered, 10);
  assert!(report.collect.missing.is_empty());
  assert!(report.collect.duplicates.is_empty());
}

#[test]
fn test_send_failure_stops_submission() {
  let mut device = MockDevice::new();
  device.fail_send_at = Some(4);
  let coordinator = Coordinator::new(&device, options(SequenceCheck::Strict));

  let err = coordinator.run(&job(10), &CancelToken::new()).unwrap_err();

  assert!(matches!(
    err,
    PipelineError::Submit {
      sequence: 4,
      source: DeviceError::Disconnected
    }
  ));
  assert_eq!(err.category(), ErrorCategory::Communication);
  assert_eq!(device.sent(), vec![0, 1, 2, 3]);
  assert_eq!(coordinator.state(), PipelineState::Aborted);
}

#[test]
fn test_receive_failure_is_reported() {
  let mut device = MockDevice::new();
  device.fail_receive_at = Some(2);

  let err = Coordinator::new(&device, options(SequenceCheck::Strict))
    .run(&job(6), &CancelToken::new())
    .unwrap_err();

  assert!(matches!(err, PipelineError::Receive { sequence: 2, .. }));
  assert_eq!(err.category(), ErrorCategory::Communication);
}

#[test]
fn test_cancelled_before_start() {
  let device = MockDevice::new();
  let cancel = CancelToken::new();
  cancel.cancel();

  let err = Coordinator::new(&device, options(SequenceCheck::Strict))
    .run(&job(5), &cancel)
    .unwrap_err();

  assert!(matches!(err, PipelineError::Interrupted { completed: 0 }));
  assert!(device.sent().is_empty());
}

#[test]
fn test_cancel_stops_running_pipeline() {
  let mut device = MockDevice::new();
  device.receive_delay = Duration::from_millis(1);
  let cancel = CancelToken::new();

  let canceller = {
    let cancel = cancel.clone();
    thread::spawn(move || {
      thread::sleep(Duration::from_millis(50));
      cancel.cancel();
    })
  };
  let err = Coordinator::new(&device, options(SequenceCheck::Strict))
    .run(&job(100_000), &cancel)
    .unwrap_err();
  canceller.join().unwrap();

  assert_eq!(err.category(), ErrorCategory::Interrupted);
  assert!(device.receives.load(Ordering::SeqCst) < 100_000);
}

#[test]
fn test_zero_loops_rejected() {
  let device = MockDevice::new();
  let err = Coordinator::new(&device, options(SequenceCheck::Strict))
    .run(&job(0), &CancelToken::new())
    .unwrap_err();
  assert_eq!(err.category(), ErrorCategory::Setup);
  assert!(device.sent().is_empty());
}
