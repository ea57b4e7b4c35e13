//! Subscriber initialization for `runlogd`: a foreground-console /
//! background-file split.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Default log directory when `--log-dir` is not given.
pub fn default_log_dir() -> PathBuf {
  dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("runlog")
}

fn env_filter() -> EnvFilter {
  EnvFilter::builder().with_default_directive(tracing::Level::INFO.into()).from_env_lossy()
}

/// `foreground`: ANSI console subscriber. Otherwise: a non-blocking daily
/// rolling file appender under `log_dir`. Either way `RUST_LOG` still
/// overrides the `info` default. Returns the guard that must be held for the
/// life of the process when file logging is in effect.
pub fn init(foreground: bool, log_dir: &Path) -> Option<WorkerGuard> {
  if foreground {
    tracing_subscriber::fmt().with_env_filter(env_filter()).with_target(true).with_ansi(true).init();
    return None;
  }

  if std::fs::create_dir_all(log_dir).is_err() {
    tracing_subscriber::fmt().with_env_filter(env_filter()).with_target(true).with_ansi(true).init();
    return None;
  }

  let file_appender = tracing_appender::rolling::daily(log_dir, "runlogd.log");
  let (writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter())
    .with_target(true)
    .with_ansi(false)
    .with_writer(writer)
    .init();

  Some(guard)
}
