use ::log::LevelFilter;
use env_logger::Env;
use std::sync::atomic::{AtomicBool, Ordering};

static ENABLE_CONSOLE: AtomicBool = AtomicBool::new(true);

/// Turn stage output on or off.
pub fn set_console(enabled: bool) {
  ENABLE_CONSOLE.store(enabled, Ordering::Relaxed);
}

/// Check if stage output is enabled, default is true
pub fn is_console_enabled() -> bool {
  ENABLE_CONSOLE.load(Ordering::Relaxed)
}

/// Install the `env_logger` backend at `info` (or `RUST_LOG`), then apply
/// `quiet`. Installing again is a no-op.
pub fn init_log(quiet: bool) {
  let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
    .format_target(false)
    .try_init();
  set_quiet(quiet);
}

/// Quiet mode caps logging at `warn` and mutes stage output. It can be
/// applied after the logger is installed, once the config is known.
pub fn set_quiet(quiet: bool) {
  if quiet {
    ::log::set_max_level(::log::max_level().min(LevelFilter::Warn));
  }
  set_console(!quiet);
}

/// Print a stage banner with a blue `[Stage]` header
#[macro_export]
macro_rules! stage {
  ($($arg:tt)*) => {
    if $crate::utils::log::is_console_enabled() {
      println!("\x1b[34m[{}]\x1b[0m", format!($($arg)*));
    }
  };
}

/// Print one ` - ` detail line under the current stage
#[macro_export]
macro_rules! stage_info {
  ($($arg:tt)*) => {
    if $crate::utils::log::is_console_enabled() {
      println!(" - {}", format!($($arg)*));
    }
  };
}
