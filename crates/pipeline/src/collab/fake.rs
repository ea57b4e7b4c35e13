//! An in-process test double implementing every collaborator trait, so the
//! Sender's finish sequence and end-to-end ingestion scenarios are
//! exercisable without a real network backend.

use std::{
  collections::BTreeMap,
  sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
  },
};

use async_trait::async_trait;
use runlog_proto::{ArtifactRecord, FilesRecord};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{
  ArtifactsSaver, CollabError, FileStream, FileStreamUpdate, FileTransferManager, GraphQlClient, JobBuilder, OperationsTracker,
  RunfilesUploader, SystemMonitor, TelemetryPeeker, TensorboardHandler, TerminalPrinter, UploadPolicy, UpsertBucketRequest,
  UpsertBucketResponse,
};

/// Everything the fake has observed, for assertions in tests.
#[derive(Debug, Default)]
pub struct FakeState {
  pub upserts: Vec<UpsertBucketRequest>,
  pub alerts: Vec<(String, String, String)>,
  pub linked_artifacts: Vec<(String, String)>,
  pub stream_started: Option<(String, String, String)>,
  pub stream_updates: Vec<FileStreamUpdate>,
  pub finished_with_exit: Option<i32>,
  pub finished_without_exit: bool,
  pub uploaded_files: Vec<String>,
  pub closed_transfer_manager: bool,
  pub saved_artifacts: Vec<ArtifactRecord>,
  pub run_stopped: bool,
  pub tb_ingested: Vec<(String, String)>,
  pub job_inputs: Vec<Option<String>>,
  pub monitor_started: bool,
  pub monitor_paused: u32,
  pub monitor_resumed: u32,
  pub monitor_finished: bool,
  /// Seeded by tests via [`FakeCollaborators::seed_operations`]; drained by
  /// [`OperationsTracker::snapshot`].
  pub pending_operations: Vec<String>,
  /// Seeded by tests via [`FakeCollaborators::seed_terminal_lines`]; drained
  /// by [`TerminalPrinter::drain`].
  pub terminal_lines: Vec<String>,
  /// Every GraphQL call this fake has resolved, as `(request, response)`.
  /// Read back (without draining) by [`TelemetryPeeker::snapshot`].
  pub network_responses: Vec<(String, String)>,
}

/// Backs every collaborator trait with one shared, lockable state blob. A
/// single fake instance is cloned (cheaply, via `Arc`) across all the trait
/// objects the Stream hands out to Sender.
pub struct FakeCollaborators {
  pub state: Mutex<FakeState>,
  pub run_should_stop: bool,
  pub fail_upsert: bool,
  /// When set, `upsert_bucket` blocks on [`Self::release_upsert`] (or the
  /// caller's cancellation token) instead of resolving immediately — lets
  /// tests exercise mailbox cancellation racing a still-in-flight upsert.
  pub hold_upsert: AtomicBool,
  upsert_gate: Notify,
}

impl Default for FakeCollaborators {
  fn default() -> Self {
    Self {
      state: Mutex::new(FakeState::default()),
      run_should_stop: false,
      fail_upsert: false,
      hold_upsert: AtomicBool::new(false),
      upsert_gate: Notify::new(),
    }
  }
}

impl FakeCollaborators {
  /// Unblocks every `upsert_bucket` call currently parked on `hold_upsert`.
  pub fn release_upsert(&self) {
    self.hold_upsert.store(false, Ordering::SeqCst);
    self.upsert_gate.notify_waiters();
  }

  pub fn seed_operations(&self, ops: Vec<String>) {
    self.state.lock().unwrap().pending_operations = ops;
  }

  pub fn seed_terminal_lines(&self, lines: Vec<String>) {
    self.state.lock().unwrap().terminal_lines = lines;
  }
}

#[async_trait]
impl GraphQlClient for FakeCollaborators {
  async fn upsert_bucket(&self, req: UpsertBucketRequest, cancel: CancellationToken) -> Result<UpsertBucketResponse, CollabError> {
    if cancel.is_cancelled() {
      return Err(CollabError::Cancelled);
    }
    if self.hold_upsert.load(Ordering::SeqCst) {
      tokio::select! {
        _ = cancel.cancelled() => return Err(CollabError::Cancelled),
        _ = self.upsert_gate.notified() => {}
      }
    }
    if self.fail_upsert {
      return Err(CollabError::Remote("simulated upsert failure".into()));
    }
    let response = UpsertBucketResponse {
      storage_id: format!("storage-{}", req.run_id),
      entity: req.entity.clone(),
      project: req.project.clone(),
      display_name: req.display_name.clone().unwrap_or_else(|| req.run_id.clone()),
      sweep_id: req.sweep_id.clone(),
      file_stream_offsets: BTreeMap::new(),
    };
    {
      let mut state = self.state.lock().unwrap();
      state.network_responses.push((format!("upsert_bucket({})", req.run_id), response.storage_id.clone()));
      state.upserts.push(req);
    }
    Ok(response)
  }

  async fn run_stopped_status(&self, entity: &str, project: &str, run_id: &str) -> Result<bool, CollabError> {
    let mut state = self.state.lock().unwrap();
    state.run_stopped = true;
    state.network_responses.push((format!("run_stopped_status({entity}/{project}/{run_id})"), self.run_should_stop.to_string()));
    Ok(self.run_should_stop)
  }

  async fn notify_alert(&self, title: &str, text: &str, level: &str) -> Result<(), CollabError> {
    let mut state = self.state.lock().unwrap();
    state.network_responses.push((format!("notify_alert({title})"), "ok".into()));
    state.alerts.push((title.into(), text.into(), level.into()));
    Ok(())
  }

  async fn link_artifact(&self, artifact_id: &str, target: &str) -> Result<(), CollabError> {
    let mut state = self.state.lock().unwrap();
    state.network_responses.push((format!("link_artifact({artifact_id})"), "ok".into()));
    state.linked_artifacts.push((artifact_id.into(), target.into()));
    Ok(())
  }
}

#[async_trait]
impl FileStream for FakeCollaborators {
  async fn start(&self, entity: &str, project: &str, run_id: &str, _offsets: BTreeMap<String, u64>) {
    self.state.lock().unwrap().stream_started = Some((entity.into(), project.into(), run_id.into()));
  }

  async fn stream_update(&self, update: FileStreamUpdate) {
    self.state.lock().unwrap().stream_updates.push(update);
  }

  async fn finish_with_exit(&self, exit_code: i32) {
    self.state.lock().unwrap().finished_with_exit = Some(exit_code);
  }

  async fn finish_without_exit(&self) {
    self.state.lock().unwrap().finished_without_exit = true;
  }
}

#[async_trait]
impl FileTransferManager for FakeCollaborators {
  async fn enqueue(&self, path: String) {
    self.state.lock().unwrap().uploaded_files.push(path);
  }

  async fn close(&self) {
    self.state.lock().unwrap().closed_transfer_manager = true;
  }
}

#[async_trait]
impl RunfilesUploader for FakeCollaborators {
  async fn process(&self, files: &FilesRecord) {
    let mut state = self.state.lock().unwrap();
    for entry in &files.files {
      state.uploaded_files.push(entry.path.clone());
    }
  }

  async fn upload_now(&self, path: &str, _policy: UploadPolicy) {
    self.state.lock().unwrap().uploaded_files.push(path.to_string());
  }

  async fn upload_remaining(&self) {}

  async fn finish(&self) {}
}

#[async_trait]
impl ArtifactsSaver for FakeCollaborators {
  async fn save(&self, artifact: ArtifactRecord, _history_step: Option<u64>, _staging_dir: Option<String>) -> Result<(), CollabError> {
    self.state.lock().unwrap().saved_artifacts.push(artifact);
    Ok(())
  }
}

impl SystemMonitor for FakeCollaborators {
  fn start(&self) {
    self.state.lock().unwrap().monitor_started = true;
  }

  fn pause(&self) {
    self.state.lock().unwrap().monitor_paused += 1;
  }

  fn resume(&self) {
    self.state.lock().unwrap().monitor_resumed += 1;
  }

  fn finish(&self) {
    self.state.lock().unwrap().monitor_finished = true;
  }

  fn get_buffer(&self) -> Vec<(String, f64)> {
    vec![("cpu".into(), 0.0)]
  }
}

impl TelemetryPeeker for FakeCollaborators {
  fn snapshot(&self) -> Vec<(String, String)> {
    self.state.lock().unwrap().network_responses.clone()
  }
}

impl OperationsTracker for FakeCollaborators {
  fn snapshot(&self) -> Vec<String> {
    self.state.lock().unwrap().pending_operations.clone()
  }
}

impl TerminalPrinter for FakeCollaborators {
  fn drain(&self) -> Vec<String> {
    std::mem::take(&mut self.state.lock().unwrap().terminal_lines)
  }
}

#[async_trait]
impl TensorboardHandler for FakeCollaborators {
  async fn ingest(&self, log_dir: &str, root_dir: &str) {
    self.state.lock().unwrap().tb_ingested.push((log_dir.into(), root_dir.into()));
  }
}

#[async_trait]
impl JobBuilder for FakeCollaborators {
  async fn note_job_input(&self, artifact_id: Option<String>) {
    self.state.lock().unwrap().job_inputs.push(artifact_id);
  }

  async fn build(&self) -> Option<ArtifactRecord> {
    None
  }
}
