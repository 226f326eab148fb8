use crate::device::sim::{SimDeviceConfig, DEFAULT_TIMEOUT_MS};
use crate::device::UsbSpeed;
use crate::error::ConfigError;
use crate::inference::ChannelOrdering;
use crate::input::{ImageFormat, InputOptions, NormalizeMode, PaddingMode, ResizeMode};
use crate::pipeline::{PipelineOptions, SequenceCheck};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Built-in defaults, compiled into the binary.
pub const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceSection {
  /// Unset: first connectable device.
  #[serde(default)]
  pub port_id: Option<u32>,
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  #[serde(default = "default_min_usb_speed")]
  pub min_usb_speed: UsbSpeed,
  #[serde(default)]
  pub simulated: Vec<SimDeviceConfig>,
}

fn default_timeout_ms() -> u64 {
  DEFAULT_TIMEOUT_MS
}

fn default_min_usb_speed() -> UsbSpeed {
  UsbSpeed::Super
}

impl Default for DeviceSection {
  fn default() -> Self {
    Self {
      port_id: None,
      timeout_ms: default_timeout_ms(),
      min_usb_speed: default_min_usb_speed(),
      simulated: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InferenceSection {
  #[serde(default)]
  pub model_path: String,
  #[serde(default)]
  pub model_index: usize,
  /// Empty: generated test pattern.
  #[serde(default)]
  pub image_path: String,
  #[serde(default = "default_image_format")]
  pub image_format: ImageFormat,
  #[serde(default = "default_resize")]
  pub resize: ResizeMode,
  #[serde(default = "default_padding")]
  pub padding: PaddingMode,
  #[serde(default = "default_normalize")]
  pub normalize: NormalizeMode,
  #[serde(default = "default_channel_ordering")]
  pub channel_ordering: ChannelOrdering,
}

fn default_image_format() -> ImageFormat {
  ImageFormat::Rgb565
}

fn default_resize() -> ResizeMode {
  ResizeMode::Enable
}

fn default_padding() -> PaddingMode {
  PaddingMode::Corner
}

fn default_normalize() -> NormalizeMode {
  NormalizeMode::Kneron
}

fn default_channel_ordering() -> ChannelOrdering {
  ChannelOrdering::Chw
}

impl Default for InferenceSection {
  fn default() -> Self {
    Self {
      model_path: String::new(),
      model_index: 0,
      image_path: String::new(),
      image_format: default_image_format(),
      resize: default_resize(),
      padding: default_padding(),
      normalize: default_normalize(),
      channel_ordering: default_channel_ordering(),
    }
  }
}

impl InferenceSection {
  pub fn input_options(&self) -> InputOptions {
    InputOptions {
      resize: self.resize,
      padding: self.padding,
      normalize: self.normalize,
    }
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineSection {
  #[serde(default = "default_loop_count")]
  pub loop_count: u32,
  #[serde(default = "default_handoff_timeout_ms")]
  pub handoff_timeout_ms: u64,
  #[serde(default = "default_sequence_check")]
  pub sequence_check: SequenceCheck,
  #[serde(default)]
  pub progress: bool,
}

fn default_loop_count() -> u32 {
  100
}

fn default_handoff_timeout_ms() -> u64 {
  3000
}

fn default_sequence_check() -> SequenceCheck {
  SequenceCheck::Strict
}

impl Default for PipelineSection {
  fn default() -> Self {
    Self {
      loop_count: default_loop_count(),
      handoff_timeout_ms: default_handoff_timeout_ms(),
      sequence_check: default_sequence_check(),
      progress: false,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportSection {
  /// Empty: no JSON report.
  #[serde(default)]
  pub json_path: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogSection {
  #[serde(default)]
  pub quiet: bool,
}

/// Application configuration, one struct per TOML section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
  #[serde(default)]
  pub device: DeviceSection,
  #[serde(default)]
  pub inference: InferenceSection,
  #[serde(default)]
  pub pipeline: PipelineSection,
  #[serde(default)]
  pub report: ReportSection,
  #[serde(default)]
  pub log: LogSection,
}

impl AppConfig {
  pub fn pipeline_options(&self) -> PipelineOptions {
    PipelineOptions {
      handoff_timeout: Duration::from_millis(self.pipeline.handoff_timeout_ms),
      sequence_check: self.pipeline.sequence_check,
      ordering: self.inference.channel_ordering,
      progress: self.pipeline.progress && !self.log.quiet,
    }
  }
}

/// Values given on the command line. `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
  pub port_id: Option<u32>,
  pub loop_count: Option<u32>,
  pub model_path: Option<String>,
  pub image_path: Option<String>,
  pub image_format: Option<ImageFormat>,
  pub normalize: Option<NormalizeMode>,
  pub channel_ordering: Option<ChannelOrdering>,
  pub json_report: Option<String>,
  pub quiet: bool,
}

/// Parse the built-in defaults.
pub fn load_default_config() -> Result<toml::Value, ConfigError> {
  Ok(toml::from_str(DEFAULT_CONFIG)?)
}

/// Read one TOML file without interpreting it yet.
pub fn load_config_file(path: &Path) -> Result<toml::Value, ConfigError> {
  let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(toml::from_str(&content)?)
}

/// Merge `override_config` over `base`. Tables merge key by key, any other
/// value (arrays included) is replaced.
pub fn merge_config(base: toml::Value, override_config: toml::Value) -> toml::Value {
  match (base, override_config) {
    (toml::Value::Table(mut base), toml::Value::Table(overrides)) => {
      for (key, value) in overrides {
        let merged = match base.remove(&key) {
          Some(existing) => merge_config(existing, value),
          None => value,
        };
        base.insert(key, merged);
      }
      toml::Value::Table(base)
    }
    (_, value) => value,
  }
}

pub fn apply_cli_overrides(config: &mut AppConfig, cli: &CliOverrides) {
  if let Some(port_id) = cli.port_id {
    config.device.port_id = Some(port_id);
  }
  if let Some(loop_count) = cli.loop_count {
    config.pipeline.loop_count = loop_count;
  }
  if let Some(path) = &cli.model_path {
    config.inference.model_path = path.clone();
  }
  if let Some(path) = &cli.image_path {
    config.inference.image_path = path.clone();
  }
  if let Some(format) = cli.image_format {
    config.inference.image_format = format;
  }
  if let Some(normalize) = cli.normalize {
    config.inference.normalize = normalize;
  }
  if let Some(ordering) = cli.channel_ordering {
    config.inference.channel_ordering = ordering;
  }
  if let Some(path) = &cli.json_report {
    config.report.json_path = path.clone();
  }
  if cli.quiet {
    config.log.quiet = true;
  }
}

pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
  if config.pipeline.loop_count == 0 {
    return Err(ConfigError::Invalid("pipeline.loop_count must be at least 1".to_string()));
  }
  if config.device.timeout_ms == 0 {
    return Err(ConfigError::Invalid("device.timeout_ms cannot be 0".to_string()));
  }
  if config.pipeline.handoff_timeout_ms == 0 {
    return Err(ConfigError::Invalid("pipeline.handoff_timeout_ms cannot be 0".to_string()));
  }
  if config.inference.model_path.trim().is_empty() {
    return Err(ConfigError::Invalid(
      "inference.model_path cannot be empty, set it in the config file or with --model".to_string(),
    ));
  }

  let mut ports = HashSet::new();
  for device in &config.device.simulated {
    if !ports.insert(device.port_id) {
      return Err(ConfigError::Invalid(format!(
        "port {} is listed twice in device.simulated",
        device.port_id
      )));
    }
  }

  Ok(())
}

/// Make relative paths from config files relative to `root`.
pub fn resolve_paths(config: &mut AppConfig, root: &Path) {
  config.inference.model_path = resolve_single_path(&config.inference.model_path, root);
  config.inference.image_path = resolve_single_path(&config.inference.image_path, root);
  config.report.json_path = resolve_single_path(&config.report.json_path, root);
}

fn resolve_single_path(path_str: &str, root: &Path) -> String {
  let path = Path::new(path_str);
  if path_str.is_empty() || path.is_absolute() {
    return path_str.to_string();
  }
  root.join(path).to_string_lossy().to_string()
}

/// Build the final configuration.
///
/// Defaults, then the custom file, are merged and resolved against `root`;
/// command line values are applied afterwards and used as given.
pub fn load_and_merge_configs(
  custom_config_path: Option<&Path>,
  root: &Path,
  cli: &CliOverrides,
) -> Result<AppConfig, ConfigError> {
  let mut value = load_default_config()?;

  if let Some(custom_path) = custom_config_path {
    let custom_path: PathBuf = if custom_path.is_absolute() {
      custom_path.to_path_buf()
    } else {
      root.join(custom_path)
    };
    value = merge_config(value, load_config_file(&custom_path)?);
  }

  let mut config: AppConfig = value.try_into()?;
  resolve_paths(&mut config, root);
  apply_cli_overrides(&mut config, cli);
  validate_config(&config)?;

  Ok(config)
}
