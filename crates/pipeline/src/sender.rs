//! The Sender stage: record dispatch, run upsert, the finish
//! sequence, and hang detection.

use std::{
  collections::BTreeMap,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use runlog_core::settings::Settings;
use runlog_proto::{
  ArtifactRecord, Control, ExitRecord, MetricDefinition, MetricPath, Record, RecordKind, RequestKind, ResponseRecord, RunRecord,
  TelemetryRecord, Value,
};
use tokio::{
  sync::{Mutex, Notify, mpsc},
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::{
  collab::{
    ArtifactsSaver, FileStream, FileStreamUpdate, FileTransferManager, GraphQlClient, JobBuilder, OperationsTracker, RunfilesUploader,
    SystemMonitor, TelemetryPeeker, TensorboardHandler, TerminalPrinter, UpsertBucketRequest, UpsertBucketResponse,
  },
  dispatcher::{Dispatcher, Mailbox},
  hang::HangMonitor,
  summary::RunSummary,
  work::{ExitWork, MaybeSavedWork, RunUpdateWork, SentinelWork, Work},
};

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
  #[error("the flush barrier's injector channel is closed")]
  InjectorClosed,
}

/// Bundles the collaborator trait objects the Sender talks to. A
/// single struct rather than five constructor arguments.
#[derive(Clone)]
pub struct Collaborators {
  pub graphql: Arc<dyn GraphQlClient>,
  pub file_stream: Arc<dyn FileStream>,
  pub file_transfer: Arc<dyn FileTransferManager>,
  pub runfiles: Arc<dyn RunfilesUploader>,
  pub artifacts: Arc<dyn ArtifactsSaver>,
  pub system_monitor: Arc<dyn SystemMonitor>,
  pub tensorboard: Arc<dyn TensorboardHandler>,
  pub job_builder: Arc<dyn JobBuilder>,
  pub terminal_printer: Arc<dyn TerminalPrinter>,
  pub operations_tracker: Arc<dyn OperationsTracker>,
  pub telemetry: Arc<dyn TelemetryPeeker>,
}

/// StreamRun: holds the authoritative RunUpserter once the run is
/// initialized. Owned exclusively by the Sender, which also keeps its own
/// mirror `RunSummary` (advanced by forwarded summary records, possibly
/// lagging the Handler's authoritative copy).
#[derive(Debug, Clone)]
pub struct StreamRun {
  pub entity: String,
  pub project: String,
  pub run_id: String,
  pub display_name: Option<String>,
  pub sweep_id: Option<String>,
  pub notes: Option<String>,
  pub tags: Vec<String>,
  pub host: Option<String>,
  pub program: Option<String>,
  pub commit: Option<String>,
  pub repo: Option<String>,
  pub job_type: Option<String>,
  pub storage_id: Option<String>,
  pub start_time_unix_ms: i64,
  pub file_stream_offsets: BTreeMap<String, u64>,
  pub config: BTreeMap<MetricPath, Value>,
  /// Folded in with telemetry: the wire protocol has no distinct
  /// `Environment` record (see DESIGN.md "Environment record folded into
  /// Telemetry").
  pub telemetry: Vec<(String, Value)>,
  pub metric_definitions: Vec<MetricDefinition>,
  config_dirty: bool,
}

impl StreamRun {
  fn from_run_record(run: &RunRecord) -> Self {
    let mut config = BTreeMap::new();
    for (path, value) in &run.config.updates {
      config.insert(path.clone(), value.clone());
    }
    for path in &run.config.removes {
      config.remove(path);
    }
    Self {
      entity: run.entity.clone(),
      project: run.project.clone(),
      run_id: run.run_id.clone(),
      display_name: run.display_name.clone(),
      sweep_id: run.sweep_id.clone(),
      notes: run.notes.clone(),
      tags: run.tags.clone(),
      host: run.host.clone(),
      program: run.program.clone(),
      commit: run.commit.clone(),
      repo: run.repo.clone(),
      job_type: run.job_type.clone(),
      storage_id: None,
      start_time_unix_ms: run.start_time_unix_ms,
      config,
      telemetry: Vec::new(),
      metric_definitions: Vec::new(),
      config_dirty: false,
    }
  }

  fn apply_upsert_response(&mut self, resp: UpsertBucketResponse) {
    self.storage_id = Some(resp.storage_id);
    self.entity = resp.entity;
    self.project = resp.project;
    self.display_name = Some(resp.display_name);
    self.sweep_id = resp.sweep_id;
    self.file_stream_offsets = resp.file_stream_offsets;
  }

  fn apply_config(&mut self, config: &runlog_proto::ConfigRecord) {
    for (path, value) in &config.updates {
      self.config.insert(path.clone(), value.clone());
    }
    for path in &config.removes {
      self.config.remove(path);
    }
    self.config_dirty = true;
  }

  fn apply_telemetry(&mut self, telemetry: &TelemetryRecord) {
    self.telemetry.extend(telemetry.items.iter().cloned());
  }

  fn register_metric_definition(&mut self, def: MetricDefinition) {
    self.metric_definitions.push(def);
  }

  fn config_json(&self) -> serde_json::Value {
    let flat: BTreeMap<String, Value> = self.config.iter().map(|(k, v)| (k.join("."), v.clone())).collect();
    serde_json::to_value(flat).unwrap_or(serde_json::Value::Null)
  }

  fn upsert_request(&self) -> UpsertBucketRequest {
    UpsertBucketRequest {
      entity: self.entity.clone(),
      project: self.project.clone(),
      run_id: self.run_id.clone(),
      display_name: self.display_name.clone(),
      sweep_id: self.sweep_id.clone(),
      notes: self.notes.clone(),
      tags: self.tags.clone(),
      host: self.host.clone(),
      program: self.program.clone(),
      commit: self.commit.clone(),
      repo: self.repo.clone(),
      job_type: self.job_type.clone(),
      config_json: self.config_json(),
    }
  }
}

struct SenderState {
  run: Option<StreamRun>,
  /// The Sender's own mirror summary, advanced only by forwarded `Summary`
  /// and `History` records — may lag the Handler's authoritative copy.
  summary: RunSummary,
  metric_definitions: Vec<MetricDefinition>,
  exited: bool,
  sync_finish_pending: Option<Record>,
  artifact_tasks: Vec<JoinHandle<()>>,
}

impl SenderState {
  fn new() -> Self {
    Self {
      run: None,
      summary: RunSummary::default(),
      metric_definitions: Vec::new(),
      exited: false,
      sync_finish_pending: None,
      artifact_tasks: Vec::new(),
    }
  }
}

/// Warn after 10 minutes of an item not completing, up to 6 times.
const HANG_THRESHOLD: Duration = Duration::from_secs(600);
const HANG_MAX_WARNINGS: u32 = 6;

/// The Sender stage proper. `state` is the "coarse lock" (Coarse
/// Sender lock) held during `process` and during the finish sequence's
/// critical sections.
pub struct Sender {
  settings: Arc<Settings>,
  collab: Collaborators,
  dispatcher: Arc<Dispatcher>,
  mailbox: Arc<Mailbox>,
  client_id: String,
  state: Mutex<SenderState>,
  /// Clone of the channel the Sender itself drains from — the flush
  /// barrier injects a `Sentinel` `Work` back into it (Sentinels
  /// for flush barriers).
  self_tx: mpsc::Sender<MaybeSavedWork>,
  sentinel_counter: AtomicU64,
  observed_tag: AtomicU64,
  notify: Notify,
  /// Cancelled to "mark the whole runwork channel done": on an
  /// initial-upsert timeout or client-initiated cancel, or once the
  /// finish sequence completes (stage 8).
  stream_cancellation: CancellationToken,
  hang: HangMonitor,
}

impl Sender {
  pub fn new(
    settings: Arc<Settings>,
    collab: Collaborators,
    dispatcher: Arc<Dispatcher>,
    mailbox: Arc<Mailbox>,
    client_id: impl Into<String>,
    self_tx: mpsc::Sender<MaybeSavedWork>,
    stream_cancellation: CancellationToken,
  ) -> Self {
    Self {
      settings,
      collab,
      dispatcher,
      mailbox,
      client_id: client_id.into(),
      state: Mutex::new(SenderState::new()),
      self_tx,
      sentinel_counter: AtomicU64::new(0),
      observed_tag: AtomicU64::new(0),
      notify: Notify::new(),
      stream_cancellation,
      hang: HangMonitor::new(HANG_THRESHOLD, HANG_MAX_WARNINGS),
    }
  }

  /// Flush barrier (flush_work): ... pushes a sentinel Work to
  /// the input channel... and blocks... until the Sender's main task has
  /// observed a sentinel value >= that one.
  pub async fn flush_work(&self) -> Result<(), SenderError> {
    let tag = self.sentinel_counter.fetch_add(1, Ordering::SeqCst) + 1;
    self
      .self_tx
      .send(MaybeSavedWork::unsaved(Work::Sentinel(SentinelWork { tag })))
      .await
      .map_err(|_| SenderError::InjectorClosed)?;

    loop {
      let notified = self.notify.notified();
      if self.observed_tag.load(Ordering::SeqCst) >= tag {
        return Ok(());
      }
      notified.await;
    }
  }

  /// Drains `rx`, processing one `Work` item at a time, until the channel
  /// closes or `cancellation` fires. This is the Sender's single consumer
  /// loop (A single consumer task Do(in_chan)).
  pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<MaybeSavedWork>, cancellation: CancellationToken) {
    loop {
      tokio::select! {
        biased;
        _ = cancellation.cancelled() => break,
        item = rx.recv() => {
          let Some(item) = item else { break };
          self.hang.begin(item.work.debug_info());
          self.process(item.work).await;
          self.hang.end();
        }
      }
    }
    debug!("sender main loop exiting");
  }

  /// A standalone task that periodically polls the hang monitor and warns
  ///. Runs for the lifetime of the Sender.
  pub async fn run_hang_detector(self: Arc<Self>, cancellation: CancellationToken) {
    let mut interval = tokio::time::interval(HANG_THRESHOLD);
    loop {
      tokio::select! {
        _ = cancellation.cancelled() => break,
        _ = interval.tick() => {
          if let Some(description) = self.hang.poll() {
            warn!(work = %description, "sender has not finished processing an item for over 10 minutes");
          }
        }
      }
    }
  }

  async fn process(self: &Arc<Self>, work: Work) {
    match work {
      Work::Sentinel(SentinelWork { tag }) => {
        self.observed_tag.fetch_max(tag, Ordering::SeqCst);
        self.notify.notify_waiters();
      }
      Work::RunUpdate(w) => self.process_run_update(w).await,
      Work::Tensorboard(w) => self.collab.tensorboard.ingest(&w.log_dir, &w.root_dir).await,
      Work::Exit(w) => self.begin_finish_sequence(w).await,
      Work::Generic(w) => self.process_generic(w.record).await,
    }
  }

  async fn respond(&self, control: &Control, response: ResponseRecord) {
    if !control.expects_reply() {
      return;
    }
    let echoed = Control {
      mailbox_slot: control.mailbox_slot.clone(),
      connection_id: control.connection_id.clone(),
      uuid: control.uuid,
      local: true,
      ..Default::default()
    };
    self.dispatcher.dispatch(Record::new(RecordKind::Response(response)).with_control(echoed)).await;
  }

  /// Run: if first-time and resume/fork/rewind selected,
  /// validate exactly one is selected; delegate to the appropriate branch
  /// strategy... before calling upsert... Subsequent Run updates are
  /// fire-and-forget.
  async fn process_run_update(self: &Arc<Self>, w: RunUpdateWork) {
    if !w.is_first_time {
      if self.settings.offline {
        return;
      }
      let req = {
        let state = self.state.lock().await;
        match &state.run {
          Some(run) => run.upsert_request(),
          None => {
            warn!("received a non-first-time Run update before the run was ever initialized");
            return;
          }
        }
      };
      if let Err(err) = self.collab.graphql.upsert_bucket(req, CancellationToken::new()).await {
        warn!(error = %err, "fire-and-forget run update failed");
      }
      return;
    }

    if w.run.branch.selected_count() > 1 {
      self
        .respond(&w.record.control, ResponseRecord::Error { message: "at most one of resume/fork_from/resume_from may be selected".into() })
        .await;
      return;
    }
    // Branch resolution (resume/fork/rewind requires a remote fetch to
    // resolve prior state) is an external collaborator concern; the core
    // only needs to ensure exactly one was selected before upsert.

    // The GraphQL client is nil when offline: no upsert call is
    // made, but the run must still be populated locally and acknowledged.
    if self.settings.offline {
      let run = StreamRun::from_run_record(&w.run);
      self.respond(&w.record.control, ResponseRecord::Run(w.run.clone())).await;
      self.state.lock().await.run = Some(run);
      return;
    }

    let cancel = match &w.record.control.mailbox_slot {
      Some(slot) => self.mailbox.add(slot.clone()),
      None => CancellationToken::new(),
    };

    let mut run = StreamRun::from_run_record(&w.run);
    let req = run.upsert_request();
    let timeout = self.settings.graphql_retry.timeout;

    let outcome = tokio::time::timeout(timeout, self.collab.graphql.upsert_bucket(req, cancel.clone())).await;

    match outcome {
      Err(_) => {
        warn!(run_id = %w.run.run_id, "initial run upsert timed out; abandoning run");
        self.respond(&w.record.control, ResponseRecord::Error { message: "run upsert timed out".into() }).await;
        self.stream_cancellation.cancel();
      }
      Ok(Err(err)) if cancel.is_cancelled() => {
        debug!(error = %err, "initial run upsert cancelled by client");
        self.respond(&w.record.control, ResponseRecord::Error { message: "run upsert cancelled".into() }).await;
        self.stream_cancellation.cancel();
      }
      Ok(Err(err)) => {
        warn!(error = %err, "initial run upsert failed");
        self.respond(&w.record.control, ResponseRecord::Error { message: err.to_string() }).await;
      }
      Ok(Ok(resp)) => {
        run.apply_upsert_response(resp);
        self.respond(&w.record.control, ResponseRecord::Run(w.run.clone())).await;
        self.state.lock().await.run = Some(run);
      }
    }

    if let Some(slot) = &w.record.control.mailbox_slot {
      self.mailbox.forget(slot);
    }
  }

  fn is_data_mutating(kind: &RecordKind) -> bool {
    matches!(
      kind,
      RecordKind::History(_)
        | RecordKind::Summary(_)
        | RecordKind::Stats(_)
        | RecordKind::Output(_)
        | RecordKind::Preempting
        | RecordKind::Config(_)
        | RecordKind::Files(_)
        | RecordKind::Artifact(_)
    )
  }

  /// The record dispatch table for everything that isn't a `Run`,
  /// `Tbrecord`, or `Exit` (those get their own `Work` variants).
  async fn process_generic(self: &Arc<Self>, record: Record) {
    {
      let state = self.state.lock().await;
      if state.exited && Self::is_data_mutating(&record.kind) {
        warn!(kind = ?std::mem::discriminant(&record.kind), "data record received after exit was observed; dropping (programming error)");
        return;
      }
    }

    match record.kind {
      RecordKind::Header(_) => debug!("sender forwarded header record"),
      RecordKind::Footer => {}

      RecordKind::History(history) => {
        let json = serde_json::to_value(&history).unwrap_or(serde_json::Value::Null);
        self.collab.file_stream.stream_update(FileStreamUpdate::History(json)).await;
        let mut state = self.state.lock().await;
        let definitions = state.metric_definitions.clone();
        state.summary.apply_history(&history, &definitions);
      }
      RecordKind::Summary(summary) => {
        for item in &summary.items {
          self.state.lock().await.summary.apply_item(item);
        }
        let json = self.state.lock().await.summary.to_json();
        self.collab.file_stream.stream_update(FileStreamUpdate::Summary(json)).await;
      }
      RecordKind::Stats(stats) => {
        let json = serde_json::to_value(&stats).unwrap_or(serde_json::Value::Null);
        self.collab.file_stream.stream_update(FileStreamUpdate::Stats(json)).await;
      }
      RecordKind::Preempting => self.collab.file_stream.stream_update(FileStreamUpdate::Preempting).await,
      RecordKind::Output(output) => {
        self
          .collab
          .file_stream
          .stream_update(FileStreamUpdate::Console { line: output.line, is_stderr: output.is_stderr })
          .await;
      }

      RecordKind::Config(config) => {
        let mut state = self.state.lock().await;
        if let Some(run) = state.run.as_mut() {
          run.apply_config(&config);
        } else {
          warn!("config record received before the run was initialized");
        }
      }
      RecordKind::Telemetry(telemetry) => {
        let mut state = self.state.lock().await;
        if let Some(run) = state.run.as_mut() {
          run.apply_telemetry(&telemetry);
        }
      }
      RecordKind::Metric(def) => {
        let mut state = self.state.lock().await;
        state.metric_definitions.push(def.clone());
        if let Some(run) = state.run.as_mut() {
          run.register_metric_definition(def);
        }
      }

      RecordKind::Files(files) => self.collab.runfiles.process(&files).await,
      RecordKind::Artifact(artifact) => self.spawn_artifact_save(artifact, None, None).await,
      RecordKind::UseArtifact { artifact_id } => self.collab.job_builder.note_job_input(Some(artifact_id)).await,
      RecordKind::Alert { title, text, level } => {
        if let Err(err) = self.collab.graphql.notify_alert(&title, &text, &level).await {
          warn!(error = %err, "alert notification failed");
        }
      }

      RecordKind::Request(request) => self.process_request(request, &record.control).await,
      RecordKind::Response(_) => {}
      RecordKind::Run(_) | RecordKind::Exit(_) | RecordKind::RunFinishWithoutExit | RecordKind::Tbrecord { .. } => {
        unreachable!("RecordParser wraps these in dedicated Work variants")
      }
    }
  }

  async fn process_request(self: &Arc<Self>, request: RequestKind, control: &Control) {
    match request {
      RequestKind::RunStart => {
        let state = self.state.lock().await;
        if let Some(run) = &state.run {
          self.collab.file_stream.start(&run.entity, &run.project, &run.run_id, run.file_stream_offsets.clone()).await;
        }
      }
      RequestKind::StopStatus => {
        if self.settings.offline {
          self.respond(control, ResponseRecord::StopStatus { run_should_stop: false }).await;
          return;
        }
        let (entity, project, run_id) = {
          let state = self.state.lock().await;
          match &state.run {
            Some(run) => (run.entity.clone(), run.project.clone(), run.run_id.clone()),
            None => {
              self.respond(control, ResponseRecord::StopStatus { run_should_stop: false }).await;
              return;
            }
          }
        };
        let run_should_stop = self.collab.graphql.run_stopped_status(&entity, &project, &run_id).await.unwrap_or(false);
        self.respond(control, ResponseRecord::StopStatus { run_should_stop }).await;
      }
      RequestKind::NetworkStatus => {
        let network_responses = self.collab.telemetry.snapshot().into_iter().map(|(request, response)| format!("{request}: {response}")).collect();
        self.respond(control, ResponseRecord::NetworkStatus { network_responses }).await;
      }
      RequestKind::LogArtifact { artifact, staging_dir } => self.spawn_artifact_save(artifact, None, staging_dir).await,
      RequestKind::LinkArtifact { artifact_id, target } => {
        let result = self.collab.graphql.link_artifact(&artifact_id, &target).await;
        match result {
          Ok(()) => self.respond(control, ResponseRecord::Ack).await,
          Err(err) => self.respond(control, ResponseRecord::Error { message: err.to_string() }).await,
        }
      }
      RequestKind::DownloadArtifact { artifact_id } => {
        // No download collaborator is defined here; acknowledged so the
        // client is never left waiting (always return some response).
        debug!(artifact_id, "download-artifact is a no-op in this core (collaborator out of scope)");
        self.respond(control, ResponseRecord::Ack).await;
      }
      RequestKind::JobInput => {
        self.collab.job_builder.note_job_input(None).await;
        self.respond(control, ResponseRecord::Ack).await;
      }
      RequestKind::SyncFinish => {
        self.state.lock().await.sync_finish_pending = Some(Record::new(RecordKind::Request(RequestKind::SyncFinish)).with_control(control.clone()));
      }
      RequestKind::Shutdown => {
        debug!("shutdown request received by sender");
        self.respond(control, ResponseRecord::Ack).await;
      }
      other => warn!(request = ?other, "request reached the Sender with no dispatch rule (protocol drift)"),
    }
  }

  async fn spawn_artifact_save(self: &Arc<Self>, artifact: ArtifactRecord, history_step: Option<u64>, staging_dir: Option<String>) {
    let sender = Arc::clone(self);
    let handle = tokio::spawn(async move {
      if let Err(err) = sender.collab.artifacts.save(artifact, history_step, staging_dir).await {
        warn!(error = %err, "artifact save failed");
      }
    });
    self.state.lock().await.artifact_tasks.push(handle);
  }

  /// Exit / RunFinishWithoutExit: record the record pointer and
  /// launch the finish sequence. Do not respond yet.
  async fn begin_finish_sequence(self: &Arc<Self>, w: ExitWork) {
    {
      let mut state = self.state.lock().await;
      if state.exited {
        warn!("duplicate exit observed; ignoring (at most one exit response is ever sent)");
        return;
      }
      state.exited = true;
    }
    let sender = Arc::clone(self);
    tokio::spawn(async move { sender.run_finish_sequence(w).await }.instrument(info_span!("sender_finish_sequence")));
  }

  /// The finish sequence, each stage followed by a flush barrier. Runs
  /// concurrently with the Sender's main loop.
  async fn run_finish_sequence(self: Arc<Self>, w: ExitWork) {
    let exit_code = w.exit.as_ref().map(|e| e.exit_code);

    // Stage 1: finish console-logs sender. Console lines are streamed
    // synchronously as `Output` records arrive (no separate batching
    // queue in this core), so this reduces to a barrier.
    let _ = self.flush_work().await;

    // Stage 2: flush + stop the summary debounce, upload wandb-summary.json,
    // finalize the run-upserter with one last config upsert, upload config.yaml.
    {
      let mut state = self.state.lock().await;
      self.collab.runfiles.upload_now("wandb-summary.json", crate::collab::UploadPolicy::Now).await;
      if let Some(run) = state.run.as_mut() {
        run.config_dirty = false;
        if !self.settings.offline {
          let req = run.upsert_request();
          if let Err(err) = self.collab.graphql.upsert_bucket(req, CancellationToken::new()).await {
            warn!(error = %err, "final config upsert failed");
          }
        }
      }
      self.collab.runfiles.upload_now("config.yaml", crate::collab::UploadPolicy::Now).await;
    }
    let _ = self.flush_work().await;

    // Stage 3: wait for artifact tasks, build + upload the job artifact.
    let tasks = std::mem::take(&mut self.state.lock().await.artifact_tasks);
    for task in tasks {
      let _ = task.await;
    }
    if let Some(job_artifact) = self.collab.job_builder.build().await {
      if let Err(err) = self.collab.artifacts.save(job_artifact, None, None).await {
        warn!(error = %err, "job artifact upload failed");
      }
    }
    let _ = self.flush_work().await;

    // Stage 4: stop the file watcher / drain the runfiles uploader / close
    // the file-transfer manager.
    self.collab.runfiles.upload_remaining().await;
    self.collab.runfiles.finish().await;
    self.collab.file_transfer.close().await;
    let _ = self.flush_work().await;

    // Stage 5: finish the file-stream.
    match exit_code {
      Some(code) => self.collab.file_stream.finish_with_exit(code).await,
      None => self.collab.file_stream.finish_without_exit().await,
    }
    let _ = self.flush_work().await;

    // Stage 6: legacy "done" UI signal. No dedicated collaborator method
    // exists for file-transfer stats in this core; logged for parity.
    debug!("marking file-transfer stats done");

    // Stage 7: respond to the originating record.
    let sync_pending = self.state.lock().await.sync_finish_pending.take();
    match sync_pending {
      Some(sync_record) => {
        let run_url = {
          let state = self.state.lock().await;
          state.run.as_ref().map(|r| format!("https://runlog.local/{}/{}/runs/{}", r.entity, r.project, r.run_id))
        };
        self.respond(&sync_record.control, ResponseRecord::SyncFinish { run_url }).await;
      }
      None => self.respond(&w.record.control, ResponseRecord::ExitResult { exit_code }).await,
    }

    // Stage 8: mark the runwork channel as no-more-input-accepted. Queued
    // work upstream continues to be processed until stages naturally drain.
    self.stream_cancellation.cancel();
  }

  pub fn client_id(&self) -> &str {
    &self.client_id
  }

  /// True once the run's `stream_cancellation` has fired — either the
  /// finish sequence completed (stage 8) or the initial upsert timed out
  /// / was cancelled. Callers should stop issuing `handle_record` and
  /// proceed to `close` once this is true.
  pub fn is_finished(&self) -> bool {
    self.stream_cancellation.is_cancelled()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use runlog_proto::{ConfigRecord, HistoryRecord, RunBranch};
  use tokio::sync::mpsc;

  use super::*;
  use crate::collab::fake::FakeCollaborators;

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

  fn run_record() -> RunRecord {
    RunRecord {
      entity: "e".into(),
      project: "p".into(),
      run_id: "r1".into(),
      display_name: None,
      sweep_id: None,
      notes: None,
      tags: vec![],
      host: None,
      program: None,
      commit: None,
      repo: None,
      job_type: None,
      config: ConfigRecord::default(),
      branch: RunBranch::default(),
      start_time_unix_ms: 0,
    }
  }

  fn make_sender(fake: Arc<FakeCollaborators>) -> (Arc<Sender>, mpsc::Sender<MaybeSavedWork>, mpsc::Receiver<MaybeSavedWork>) {
    let (tx, rx) = mpsc::channel(32);
    let sender = Arc::new(Sender::new(
      Arc::new(Settings::default()),
      collaborators(fake),
      Arc::new(Dispatcher::new()),
      Arc::new(Mailbox::new()),
      "client-1",
      tx.clone(),
      CancellationToken::new(),
    ));
    (sender, tx, rx)
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn first_time_run_upsert_populates_state_and_responds() {
    let fake = Arc::new(FakeCollaborators::default());

    let dispatcher = Arc::new(Dispatcher::new());
    let sender = Arc::new(Sender::new(
      Arc::new(Settings::default()),
      collaborators(fake.clone()),
      dispatcher.clone(),
      Arc::new(Mailbox::new()),
      "client-1",
      mpsc::channel(8).0,
      CancellationToken::new(),
    ));

    let (conn_tx, mut conn_rx) = mpsc::channel(8);
    dispatcher.register("conn-1", crate::dispatcher::Responder::new(conn_tx));

    let control = Control { connection_id: Some("conn-1".into()), req_resp: true, ..Default::default() };
    let record = Record::new(RecordKind::Run(run_record())).with_control(control);
    let work = RunUpdateWork { record: record.clone(), run: run_record(), is_first_time: true };
    sender.process_run_update(work).await;

    assert_eq!(fake.state.lock().unwrap().upserts.len(), 1);
    let reply = conn_rx.recv().await.unwrap();
    assert!(matches!(reply.kind, RecordKind::Response(ResponseRecord::Run(_))));

    let state = sender.state.lock().await;
    assert!(state.run.is_some());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn ambiguous_branch_selection_is_rejected_before_upsert() {
    let fake = Arc::new(FakeCollaborators::default());
    let dispatcher = Arc::new(Dispatcher::new());
    let sender = Arc::new(Sender::new(
      Arc::new(Settings::default()),
      collaborators(fake.clone()),
      dispatcher.clone(),
      Arc::new(Mailbox::new()),
      "client-1",
      mpsc::channel(8).0,
      CancellationToken::new(),
    ));

    let (conn_tx, mut conn_rx) = mpsc::channel(8);
    dispatcher.register("conn-1", crate::dispatcher::Responder::new(conn_tx));

    let mut run = run_record();
    run.branch.resume = Some("allow".into());
    run.branch.fork_from = Some("abc".into());

    let control = Control { connection_id: Some("conn-1".into()), req_resp: true, ..Default::default() };
    let record = Record::new(RecordKind::Run(run.clone())).with_control(control);
    sender.process_run_update(RunUpdateWork { record, run, is_first_time: true }).await;

    assert!(fake.state.lock().unwrap().upserts.is_empty());
    let reply = conn_rx.recv().await.unwrap();
    assert!(matches!(reply.kind, RecordKind::Response(ResponseRecord::Error { .. })));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn network_status_reflects_calls_the_fake_backend_has_actually_observed() {
    let fake = Arc::new(FakeCollaborators::default());
    let dispatcher = Arc::new(Dispatcher::new());
    let sender = Arc::new(Sender::new(
      Arc::new(Settings::default()),
      collaborators(fake.clone()),
      dispatcher.clone(),
      Arc::new(Mailbox::new()),
      "client-1",
      mpsc::channel(8).0,
      CancellationToken::new(),
    ));

    let (conn_tx, mut conn_rx) = mpsc::channel(8);
    dispatcher.register("conn-1", crate::dispatcher::Responder::new(conn_tx));
    let control = Control { connection_id: Some("conn-1".into()), req_resp: true, ..Default::default() };

    // Before any network call, there is nothing to report.
    sender.process_request(RequestKind::NetworkStatus, &control).await;
    match conn_rx.recv().await.unwrap().kind {
      RecordKind::Response(ResponseRecord::NetworkStatus { network_responses }) => assert!(network_responses.is_empty()),
      other => panic!("expected NetworkStatus response, got {other:?}"),
    }

    let run = run_record();
    let record = Record::new(RecordKind::Run(run.clone())).with_control(control.clone());
    sender.process_run_update(RunUpdateWork { record, run, is_first_time: true }).await;
    let _ = conn_rx.recv().await.unwrap(); // the Run response itself

    sender.process_request(RequestKind::NetworkStatus, &control).await;
    match conn_rx.recv().await.unwrap().kind {
      RecordKind::Response(ResponseRecord::NetworkStatus { network_responses }) => {
        assert_eq!(network_responses.len(), 1);
        assert!(network_responses[0].starts_with("upsert_bucket(r1)"));
      }
      other => panic!("expected NetworkStatus response, got {other:?}"),
    }
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn flush_work_waits_for_the_sentinel_to_be_observed() {
    let fake = Arc::new(FakeCollaborators::default());
    let (sender, _tx, mut rx) = make_sender(fake);
    let sender_for_loop = Arc::clone(&sender);
    let cancellation = CancellationToken::new();
    let loop_cancel = cancellation.clone();
    let join = tokio::spawn(async move { sender_for_loop.run(rx_take(&mut rx), loop_cancel).await });

    sender.flush_work().await.unwrap();
    cancellation.cancel();
    let _ = join.await;
  }

  fn rx_take(rx: &mut mpsc::Receiver<MaybeSavedWork>) -> mpsc::Receiver<MaybeSavedWork> {
    std::mem::replace(rx, mpsc::channel(1).1)
  }

  /// Submit Run with mailbox slot "m1", then cancel "m1" before the upsert
  /// completes. Expect the upsert context is cancelled, an error response
  /// is returned, and the runwork channel (`stream_cancellation`) is marked
  /// done.
  #[tokio::test(flavor = "multi_thread")]
  async fn cancelling_the_mailbox_slot_aborts_the_in_flight_upsert() {
    let fake = Arc::new(FakeCollaborators::default());
    fake.hold_upsert.store(true, Ordering::SeqCst);

    let dispatcher = Arc::new(Dispatcher::new());
    let mailbox = Arc::new(Mailbox::new());
    let stream_cancellation = CancellationToken::new();
    let sender = Arc::new(Sender::new(
      Arc::new(Settings::default()),
      collaborators(fake.clone()),
      dispatcher.clone(),
      mailbox.clone(),
      "client-1",
      mpsc::channel(8).0,
      stream_cancellation.clone(),
    ));

    let (conn_tx, mut conn_rx) = mpsc::channel(8);
    dispatcher.register("conn-1", crate::dispatcher::Responder::new(conn_tx));

    let control = Control {
      connection_id: Some("conn-1".into()),
      mailbox_slot: Some("m1".into()),
      req_resp: true,
      ..Default::default()
    };
    let record = Record::new(RecordKind::Run(run_record())).with_control(control);
    let work = RunUpdateWork { record, run: run_record(), is_first_time: true };

    let sender_for_upsert = Arc::clone(&sender);
    let upsert_task = tokio::spawn(async move { sender_for_upsert.process_run_update(work).await });

    // Give the upsert time to park on the held gate before cancelling.
    tokio::task::yield_now().await;
    mailbox.cancel("m1");
    upsert_task.await.unwrap();

    let reply = conn_rx.recv().await.unwrap();
    assert!(matches!(reply.kind, RecordKind::Response(ResponseRecord::Error { .. })));
    assert!(fake.state.lock().unwrap().upserts.is_empty());
    assert!(stream_cancellation.is_cancelled());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn exit_then_history_is_dropped_as_a_programming_error() {
    let fake = Arc::new(FakeCollaborators::default());
    let (sender, _tx, _rx) = make_sender(fake.clone());

    sender
      .begin_finish_sequence(ExitWork { record: Record::new(RecordKind::Exit(ExitRecord { exit_code: 0 })), exit: Some(ExitRecord { exit_code: 0 }) })
      .await;
    // Allow the spawned finish sequence to at least mark `exited`.
    tokio::task::yield_now().await;

    sender
      .process_generic(Record::new(RecordKind::History(HistoryRecord { step: 0, items: vec![], client_id: None })))
      .await;

    assert!(fake.state.lock().unwrap().stream_updates.is_empty());
  }
}
