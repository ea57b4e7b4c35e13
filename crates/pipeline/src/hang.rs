//! Hang detection for the Sender's main loop.
//!
//! Kept as plain, pollable state rather than a self-contained timer task so
//! the warning cadence is unit-testable without sleeping for real minutes;
//! [`sender::spawn`](crate::sender::spawn) drives [`HangMonitor::poll`] from
//! a `tokio::time::interval` ticking at `threshold`.

use std::{sync::Mutex, time::Instant};

use std::time::Duration;

struct HangState {
  current: Option<(String, Instant)>,
  warnings_issued: u32,
}

/// Tracks the single in-flight `Work` item the Sender is currently
/// processing and how many "still hung" warnings have fired for it.
pub struct HangMonitor {
  threshold: Duration,
  max_warnings: u32,
  state: Mutex<HangState>,
}

impl HangMonitor {
  pub fn new(threshold: Duration, max_warnings: u32) -> Self {
    Self {
      threshold,
      max_warnings,
      state: Mutex::new(HangState {
        current: None,
        warnings_issued: 0,
      }),
    }
  }

  /// Called when the Sender starts processing a new item.
  pub fn begin(&self, description: impl Into<String>) {
    let mut state = self.state.lock().unwrap();
    state.current = Some((description.into(), Instant::now()));
    state.warnings_issued = 0;
  }

  /// Called when the Sender finishes processing the current item.
  pub fn end(&self) {
    self.state.lock().unwrap().current = None;
  }

  /// If any single item exceeds 10 minutes without completing,
  /// a warning is emitted; up to 6 warnings per item... then it goes
  /// silent. Returns the item's description if a warning is due right now.
  pub fn poll(&self) -> Option<String> {
    let mut state = self.state.lock().unwrap();
    let (description, started) = state.current.clone()?;
    if state.warnings_issued >= self.max_warnings {
      return None;
    }
    if started.elapsed() < self.threshold {
      return None;
    }
    state.warnings_issued += 1;
    Some(description)
  }
}
