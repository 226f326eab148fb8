use std::sync::mpsc::{self, Receiver, SyncSender};
use std::time::Duration;

/// One-shot channel: the sender is consumed by its single `put`, the
/// receiver by its single `get_timeout`.
pub fn handoff<T: Send>() -> (HandoffSender<T>, HandoffReceiver<T>) {
  let (tx, rx) = mpsc::sync_channel(1);
  (HandoffSender { tx }, HandoffReceiver { rx })
}

pub struct HandoffSender<T> {
  tx: SyncSender<T>,
}

impl<T> HandoffSender<T> {
  /// Never blocks. The value is dropped if the receiver is already gone.
  pub fn put(self, value: T) {
    let _ = self.tx.try_send(value);
  }
}

pub struct HandoffReceiver<T> {
  rx: Receiver<T>,
}

impl<T> HandoffReceiver<T> {
  /// Wait up to `timeout` for the value. `None` if it never arrives or the
  /// sender was dropped without a put.
  pub fn get_timeout(self, timeout: Duration) -> Option<T> {
    self.rx.recv_timeout(timeout).ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn test_put_then_get() {
    let (tx, rx) = handoff();
    let writer = thread::spawn(move || tx.put(42u32));
    assert_eq!(rx.get_timeout(Duration::from_secs(1)), Some(42));
    writer.join().unwrap();
  }

  #[test]
  fn test_empty_handoff_times_out() {
    let (_tx, rx) = handoff::<u32>();
    assert_eq!(rx.get_timeout(Duration::from_millis(10)), None);
  }

  #[test]
  fn test_dropped_sender_is_empty() {
    let (tx, rx) = handoff::<u32>();
    drop(tx);
    assert_eq!(rx.get_timeout(Duration::from_secs(5)), None);
  }
}
