use clap::Parser;
use log::error;
use npustream::config::{load_and_merge_configs, CliOverrides};
use npustream::device::{DeviceProvider, SimBus};
use npustream::error::{ErrorCategory, PipelineError};
use npustream::inference::ChannelOrdering;
use npustream::input::{ImageFormat, InputImage, NormalizeMode};
use npustream::pipeline::{CancelToken, Coordinator, InferenceJob};
use npustream::session::{ConnectSettings, Session};
use npustream::utils::log::{init_log, set_quiet};
use npustream::utils::report::{print_devices, print_node_outputs, print_run_report, write_json_report};
use npustream::utils::signal::watch_interrupt;
use npustream::{stage, stage_info};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// npustream - stream one image through an NPU and measure throughput
#[derive(Parser, Debug)]
#[command(name = "npustream")]
#[command(version = "0.1.0")]
#[command(about = "Multi-threaded generic image inference on an NPU device", long_about = None)]
struct Args {
  /// Port id of the device to use (default: first connectable device)
  #[arg(short, long, value_name = "PORT")]
  port_id: Option<u32>,

  /// Config file merged over the built-in defaults
  #[arg(short, long, value_name = "FILE")]
  config: Option<PathBuf>,

  /// Number of inferences to run
  #[arg(short, long, value_name = "N")]
  loops: Option<u32>,

  /// Model manifest to upload
  #[arg(short, long, value_name = "FILE")]
  model: Option<String>,

  /// Image file to stream (BMP, PNG or JPEG)
  #[arg(short, long, value_name = "FILE")]
  image: Option<String>,

  /// Image format sent to the device: rgb565 or rgba8888
  #[arg(long, value_name = "FORMAT", value_parser = parse_value::<ImageFormat>)]
  format: Option<ImageFormat>,

  /// Normalization: none, 0_1, kneron or -1_1
  #[arg(long, value_name = "MODE", allow_hyphen_values = true, value_parser = parse_value::<NormalizeMode>)]
  normalize: Option<NormalizeMode>,

  /// Layout of retrieved node outputs: hcw, chw or hwc
  #[arg(long, value_name = "ORDER", value_parser = parse_value::<ChannelOrdering>)]
  ordering: Option<ChannelOrdering>,

  /// Quiet mode (warnings and errors only)
  #[arg(short, long)]
  quiet: bool,

  /// List devices and exit
  #[arg(long)]
  scan: bool,

  /// Write a JSON run report
  #[arg(long, value_name = "FILE")]
  json_report: Option<String>,
}

/// Parse a CLI word the same way the config file spells it.
fn parse_value<T: DeserializeOwned>(s: &str) -> Result<T, String> {
  T::deserialize(toml::Value::String(s.to_string())).map_err(|e| e.to_string())
}

fn exit_code(category: ErrorCategory) -> u8 {
  match category {
    ErrorCategory::Setup => 1,
    ErrorCategory::Connectivity => 2,
    ErrorCategory::Communication => 3,
    ErrorCategory::Handoff => 4,
    ErrorCategory::Interrupted => 130,
  }
}

fn main() -> ExitCode {
  let args = Args::parse();
  init_log(args.quiet);

  match run(args) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!("{}", e);
      eprintln!(" - Error: {}", e);
      ExitCode::from(exit_code(e.category()))
    }
  }
}

fn run(args: Args) -> Result<(), PipelineError> {
  let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
  let cli = CliOverrides {
    port_id: args.port_id,
    loop_count: args.loops,
    model_path: args.model,
    image_path: args.image,
    image_format: args.format,
    normalize: args.normalize,
    channel_ordering: args.ordering,
    json_report: args.json_report,
    quiet: args.quiet,
  };
  let config = load_and_merge_configs(args.config.as_deref(), &root, &cli)?;
  set_quiet(config.log.quiet);

  let bus = SimBus::new(config.device.simulated.clone());
  if args.scan {
    print_devices(&bus.scan());
    return Ok(());
  }

  stage!("Connect Device");
  let settings = ConnectSettings {
    port_id: config.device.port_id,
    min_usb_speed: config.device.min_usb_speed,
    timeout_ms: config.device.timeout_ms,
  };
  let mut session = Session::connect(&bus, &settings)?;
  stage_info!("Success");

  stage!("Upload Model");
  session.load_model(Path::new(&config.inference.model_path))?;
  stage_info!("Success");
  let model = session.model(config.inference.model_index)?.clone();

  stage!("Read Image");
  let format = config.inference.image_format;
  let image = if config.inference.image_path.is_empty() {
    stage_info!("no image configured, using a {}x{} test pattern", model.width, model.height);
    InputImage::test_pattern(model.width, model.height, format).map_err(|e| PipelineError::Image(e.to_string()))?
  } else {
    InputImage::load(Path::new(&config.inference.image_path), format)?
  };
  stage_info!("Success");

  let cancel = CancelToken::new();
  watch_interrupt(cancel.clone())?;

  let job = InferenceJob {
    model_id: model.id,
    image,
    options: config.inference.input_options(),
    loop_count: config.pipeline.loop_count,
  };

  stage!("Starting Inference Work");
  stage_info!("Starting inference loop {} times", job.loop_count);
  let coordinator = Coordinator::new(session.device(), config.pipeline_options());
  let report = coordinator.run(&job, &cancel)?;

  print_run_report(&report);
  print_node_outputs(&report.nodes);

  if !config.report.json_path.is_empty() {
    let path = Path::new(&config.report.json_path);
    write_json_report(path, &report)?;
    stage_info!("Report written to {}", path.display());
  }

  Ok(())
}
