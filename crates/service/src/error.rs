//! The only place this binary uses a catch-all error type; everything below
//! `main` stays on concrete, typed errors.

use runlog_core::RunId;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
  #[error("unknown run id: {0}")]
  UnknownRun(RunId),
  #[error("run id already in use: {0}")]
  DuplicateRun(RunId),
  #[error("pipeline stream error: {0}")]
  Stream(#[from] runlog_pipeline::stream::StreamError),
}
