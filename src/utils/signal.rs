use crate::pipeline::CancelToken;
use log::{info, warn};
use std::io;
use std::thread;
use tokio::runtime::Builder;
use tokio::signal;

/// Cancel `token` on the first Ctrl-C.
///
/// The watcher runs a current-thread runtime on its own detached thread, so
/// the pipeline threads stay plain std threads.
pub fn watch_interrupt(token: CancelToken) -> io::Result<()> {
  let runtime = Builder::new_current_thread().enable_all().build()?;

  thread::Builder::new().name("ctrl-c".to_string()).spawn(move || {
    runtime.block_on(async {
      match signal::ctrl_c().await {
        Ok(()) => {
          info!("interrupt received, stopping pipeline");
          token.cancel();
        }
        Err(e) => warn!("failed to listen for ctrl-c: {}", e),
      }
    });
  })?;

  Ok(())
}
