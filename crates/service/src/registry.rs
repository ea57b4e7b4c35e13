//! Service-level run registry: a `DashMap`-backed registry of every live
//! [`Stream`], keyed by run id.

use dashmap::DashMap;
use runlog_core::RunId;
use runlog_pipeline::stream::Stream;
use runlog_proto::Record;
use tokio::sync::mpsc;

use crate::error::ServiceError;

/// Owns every active [`Stream`], addressed by the local [`RunId`] — distinct
/// from the backend's `(entity, project, run_id)` triple a `Stream` only
/// learns once its initial run upsert completes.
#[derive(Default)]
pub struct RunRegistry {
  streams: DashMap<RunId, Stream>,
}

impl RunRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&self, run_id: RunId, stream: Stream) -> Result<(), ServiceError> {
    if self.streams.contains_key(&run_id) {
      return Err(ServiceError::DuplicateRun(run_id));
    }
    self.streams.insert(run_id, stream);
    Ok(())
  }

  pub fn add_responder(&self, run_id: &RunId, connection_id: impl Into<String>, tx: mpsc::Sender<Record>) -> Result<(), ServiceError> {
    let stream = self.streams.get(run_id).ok_or_else(|| ServiceError::UnknownRun(run_id.clone()))?;
    stream.add_responder(connection_id, tx);
    Ok(())
  }

  pub async fn handle_record(&self, run_id: &RunId, record: Record) -> Result<(), ServiceError> {
    let stream = self.streams.get(run_id).ok_or_else(|| ServiceError::UnknownRun(run_id.clone()))?;
    stream.handle_record(record).await?;
    Ok(())
  }

  /// Removes the run and waits for its finish sequence and every stage task
  /// to wind down via `finish_and_close`.
  pub async fn finish(&self, run_id: &RunId, exit_code: Option<i32>) -> Result<(), ServiceError> {
    let (_, stream) = self.streams.remove(run_id).ok_or_else(|| ServiceError::UnknownRun(run_id.clone()))?;
    stream.finish_and_close(exit_code).await;
    Ok(())
  }

  pub fn is_empty(&self) -> bool {
    self.streams.is_empty()
  }

  /// Finishes every still-open run without an observed exit code, for
  /// orderly shutdown (e.g. the front door's stdin reaching EOF).
  pub async fn shutdown(&self) {
    let run_ids: Vec<RunId> = self.streams.iter().map(|entry| entry.key().clone()).collect();
    for run_id in run_ids {
      if let Some((_, stream)) = self.streams.remove(&run_id) {
        stream.finish_and_close(None).await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use runlog_core::Settings;
  use runlog_pipeline::{collab::fake::FakeCollaborators, sender::Collaborators};
  use tokio::sync::mpsc;

  use super::*;

  fn collaborators(fake: Arc<FakeCollaborators>) -> Collaborators {
    Collaborators {
      graphql: fake.clone(),
      file_stream: fake.clone(),
      file_transfer: fake.clone(),
      runfiles: fake.clone(),
      artifacts: fake.clone(),
      system_monitor: fake.clone(),
      tensorboard: fake.clone(),
      terminal_printer: fake.clone(),
      operations_tracker: fake.clone(),
      telemetry: fake.clone(),
      job_builder: fake,
    }
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn unknown_run_id_is_rejected_everywhere() {
    let registry = RunRegistry::new();
    let run_id = RunId::new("missing");
    let (tx, _rx) = mpsc::channel(1);

    assert!(matches!(registry.add_responder(&run_id, "conn", tx).unwrap_err(), ServiceError::UnknownRun(_)));
    assert!(matches!(registry.finish(&run_id, None).await.unwrap_err(), ServiceError::UnknownRun(_)));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn starting_the_same_run_id_twice_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let registry = RunRegistry::new();
    let fake = Arc::new(FakeCollaborators::default());
    let settings = Arc::new(Settings::default());

    let stream = Stream::start(settings.clone(), "client-1", &dir.path().join("a.bin"), collaborators(fake.clone())).unwrap();
    registry.insert(RunId::new("run-1"), stream).unwrap();

    let duplicate = Stream::start(settings, "client-2", &dir.path().join("b.bin"), collaborators(fake)).unwrap();
    assert!(matches!(registry.insert(RunId::new("run-1"), duplicate).unwrap_err(), ServiceError::DuplicateRun(_)));

    registry.shutdown().await;
    assert!(registry.is_empty());
  }
}
