//! `Stream`: owns every stage task for one run and wires them together per
//! mode.
//!
//! Three wirings, chosen from `Settings`:
//! - **Normal**: Handler → Writer → FlowControl → Sender.
//! - **Skip transaction log** (`settings.skip_transaction_log`): Handler →
//!   Sender directly; no durability.
//! - **Sync (replay)** ([`Stream::replay`]): Reader → Handler → Sender; the
//!   Writer is omitted because the log already holds every record.
//!
//! The RecordParser that maps ingress `Record`s to `Work` lives inside the
//! Handler task rather than at the `handle_record`/Reader boundary: the two
//! placements are behaviorally identical (every ingress record still passes
//! through exactly one parser instance, in submission order) and collocating
//! it avoids exposing mutable parser state on `Stream`'s multi-caller-facing
//! API. See DESIGN.md for the full rationale.

use std::{path::Path, sync::Arc};

use runlog_core::settings::Settings;
use runlog_proto::{ExitRecord, Record, RecordKind};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span, warn};

use crate::{
  BUFFER_SIZE,
  dispatcher::{Dispatcher, Mailbox, Responder},
  flow_control,
  handler::{HandlerResult, HandlerState},
  log::{LogError, LogReader, LogWriter},
  parser::RecordParser,
  reader::{Reader, ReaderError, RunIdentityOverlay},
  sender::{Collaborators, Sender},
  work::Work,
  writer::{Writer, spawn_store_writer},
};

/// In-memory soft cap handed to FlowControl (`in_memory_size`). Not one of
/// the settings read from config, so it is fixed at the channel buffer depth
/// rather than exposed as a knob (see DESIGN.md).
const FLOW_CONTROL_IN_MEMORY_SIZE: usize = BUFFER_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
  #[error("transaction log error: {0}")]
  Log(#[from] LogError),
  #[error("failed to replay transaction log: {0}")]
  Replay(#[from] ReaderError),
  #[error("the stream is already closed")]
  Closed,
}

/// Owns every stage task for one run: all stage goroutines/tasks, the
/// transaction-log file handles, and all channels.
pub struct Stream {
  ingress: Option<mpsc::Sender<Record>>,
  dispatcher: Arc<Dispatcher>,
  mailbox: Arc<Mailbox>,
  sender: Arc<Sender>,
  /// Joined by [`Stream::close`] after the ingress channel is dropped —
  /// every one of these tasks terminates by observing a closed input
  /// channel and then closing its own output.
  channel_driven_tasks: Vec<JoinHandle<()>>,
  /// The hang detector has no input channel to close; it is cancelled
  /// explicitly, after every channel-driven task has already wound down.
  hang_cancellation: CancellationToken,
  hang_task: Option<JoinHandle<()>>,
  sync: bool,
}

impl Stream {
  /// Normal / "Skip transaction log" wirings, selected by
  /// `settings.skip_transaction_log`.
  pub fn start(
    settings: Arc<Settings>,
    client_id: impl Into<String>,
    log_path: &Path,
    collaborators: Collaborators,
  ) -> Result<Self, StreamError> {
    let client_id = client_id.into();
    let tasks_cancellation = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new());
    let mailbox = Arc::new(Mailbox::new());

    let (ingress_tx, ingress_rx) = mpsc::channel(BUFFER_SIZE);
    let (handler_out_tx, handler_out_rx) = mpsc::channel(BUFFER_SIZE);

    let mut channel_driven_tasks = vec![spawn_handler(
      settings.clone(),
      client_id.clone(),
      collaborators.system_monitor.clone(),
      collaborators.terminal_printer.clone(),
      collaborators.operations_tracker.clone(),
      ingress_rx,
      handler_out_tx.clone(),
      dispatcher.clone(),
      tasks_cancellation.clone(),
    )];

    let (sender_rx, sender_injector) = if settings.skip_transaction_log {
      // Skip-transaction-log mode has only one channel between Handler and
      // Sender; the flush barrier's sentinel injector is simply another
      // clone of the same sender half the Handler holds.
      (handler_out_rx, handler_out_tx)
    } else {
      let log_writer = LogWriter::create(log_path)?;
      let log_reader = LogReader::open(log_path)?;
      let (store, store_join) = spawn_store_writer(log_writer);
      let writer = Arc::new(Writer::new(store.clone(), settings.offline));

      let (flow_handle, flow_out_rx, flow_injector, flow_producer, flow_consumer) =
        flow_control::spawn(FLOW_CONTROL_IN_MEMORY_SIZE, BUFFER_SIZE, log_reader, store, tasks_cancellation.clone());

      let writer_task = tokio::spawn(
        crate::writer::run_stage(handler_out_rx, writer, flow_handle, tasks_cancellation.clone()).instrument(info_span!("writer")),
      );

      channel_driven_tasks.push(store_join);
      channel_driven_tasks.push(writer_task);
      channel_driven_tasks.push(flow_producer);
      channel_driven_tasks.push(flow_consumer);

      (flow_out_rx, flow_injector)
    };

    let sender = Arc::new(Sender::new(
      settings,
      collaborators,
      dispatcher.clone(),
      mailbox.clone(),
      client_id,
      sender_injector,
      CancellationToken::new(),
    ));

    let sender_task = {
      let sender = Arc::clone(&sender);
      let cancellation = tasks_cancellation.clone();
      tokio::spawn(async move { sender.run(sender_rx, cancellation).await }.instrument(info_span!("sender")))
    };
    channel_driven_tasks.push(sender_task);

    let hang_cancellation = CancellationToken::new();
    let hang_task = {
      let sender = Arc::clone(&sender);
      let cancellation = hang_cancellation.clone();
      tokio::spawn(async move { sender.run_hang_detector(cancellation).await }.instrument(info_span!("hang_detector")))
    };

    Ok(Self {
      ingress: Some(ingress_tx),
      dispatcher,
      mailbox,
      sender,
      channel_driven_tasks,
      hang_cancellation,
      hang_task: Some(hang_task),
      sync: false,
    })
  }

  /// Sync (replay): Reader → Handler → Sender (Writer omitted;
  /// exit record is read from the log). Opens `log_path` read-only and
  /// replays it into the pipeline; no external `handle_record` calls are
  /// accepted (the Reader is the sole producer).
  pub fn replay(
    settings: Arc<Settings>,
    client_id: impl Into<String>,
    log_path: &Path,
    overlay: RunIdentityOverlay,
    collaborators: Collaborators,
  ) -> Result<Self, StreamError> {
    let client_id = client_id.into();
    let tasks_cancellation = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new());
    let mailbox = Arc::new(Mailbox::new());

    let reader = Reader::open(log_path)?;
    let (reader_tx, reader_rx) = mpsc::channel(BUFFER_SIZE);
    let reader_task = tokio::spawn(
      async move {
        if let Err(err) = reader.run(overlay, reader_tx).await {
          warn!(error = %err, "sync replay aborted");
        }
      }
      .instrument(info_span!("reader")),
    );

    let (handler_out_tx, handler_out_rx) = mpsc::channel(BUFFER_SIZE);
    let handler_task = spawn_handler(
      settings.clone(),
      client_id.clone(),
      collaborators.system_monitor.clone(),
      collaborators.terminal_printer.clone(),
      collaborators.operations_tracker.clone(),
      reader_rx,
      handler_out_tx.clone(),
      dispatcher.clone(),
      tasks_cancellation.clone(),
    );

    let sender = Arc::new(Sender::new(
      settings,
      collaborators,
      dispatcher.clone(),
      mailbox.clone(),
      client_id,
      handler_out_tx,
      CancellationToken::new(),
    ));

    let sender_task = {
      let sender = Arc::clone(&sender);
      let cancellation = tasks_cancellation.clone();
      tokio::spawn(async move { sender.run(handler_out_rx, cancellation).await }.instrument(info_span!("sender")))
    };

    let hang_cancellation = CancellationToken::new();
    let hang_task = {
      let sender = Arc::clone(&sender);
      let cancellation = hang_cancellation.clone();
      tokio::spawn(async move { sender.run_hang_detector(cancellation).await }.instrument(info_span!("hang_detector")))
    };

    Ok(Self {
      ingress: None,
      dispatcher,
      mailbox,
      sender,
      channel_driven_tasks: vec![reader_task, handler_task, sender_task],
      hang_cancellation,
      hang_task: Some(hang_task),
      sync: true,
    })
  }

  /// `handle_record` parses the record into Work via the
  /// RecordParser and submits it to the ingress channel. Unavailable once
  /// the run is in sync/replay mode (the Reader is the sole producer) or
  /// after [`Stream::finish_and_close`]/[`Stream::close`] has been called.
  pub async fn handle_record(&self, record: Record) -> Result<(), StreamError> {
    let tx = self.ingress.as_ref().ok_or(StreamError::Closed)?;
    tx.send(record).await.map_err(|_| StreamError::Closed)
  }

  pub fn add_responder(&self, connection_id: impl Into<String>, tx: mpsc::Sender<Record>) {
    self.dispatcher.register(connection_id, Responder::new(tx));
  }

  pub fn remove_responder(&self, connection_id: &str) {
    self.dispatcher.unregister(connection_id);
  }

  /// the initial run upsert additionally installs a timeout that,
  /// on fire, marks the whole runwork channel done — and, symmetrically,
  /// the finish sequence's stage 8. Either way the run is over; callers
  /// should stop issuing `handle_record` and proceed to `close`.
  pub fn is_finished(&self) -> bool {
    self.sender.is_finished()
  }

  pub fn mailbox(&self) -> &Arc<Mailbox> {
    &self.mailbox
  }

  /// `finish_and_close` synthesizes an exit record (unless in
  /// sync mode, where the log already contains one), closes the ingress
  /// channel, and waits for every stage to terminate.
  pub async fn finish_and_close(mut self, exit_code: Option<i32>) {
    if !self.sync
      && let Some(tx) = self.ingress.take()
    {
      let kind = match exit_code {
        Some(code) => RecordKind::Exit(ExitRecord { exit_code: code }),
        None => RecordKind::RunFinishWithoutExit,
      };
      let _ = tx.send(Record::new(kind)).await;
    }
    self.close().await;
  }

  /// `close()` without finish is used in sync replay, where the
  /// Reader drives termination by closing its output when it reaches
  /// end-of-log.
  pub async fn close(mut self) {
    self.ingress.take();
    for task in self.channel_driven_tasks.drain(..) {
      let _ = task.await;
    }
    self.hang_cancellation.cancel();
    if let Some(task) = self.hang_task.take() {
      let _ = task.await;
    }
  }
}

fn spawn_handler(
  settings: Arc<Settings>,
  client_id: String,
  system_monitor: Arc<dyn crate::collab::SystemMonitor>,
  terminal_printer: Arc<dyn crate::collab::TerminalPrinter>,
  operations_tracker: Arc<dyn crate::collab::OperationsTracker>,
  mut ingress_rx: mpsc::Receiver<Record>,
  out_tx: mpsc::Sender<Work>,
  dispatcher: Arc<Dispatcher>,
  cancellation: CancellationToken,
) -> JoinHandle<()> {
  tokio::spawn(
    async move {
      let mut state = HandlerState::new(settings, client_id, system_monitor, terminal_printer, operations_tracker);
      let mut parser = RecordParser::new();
      loop {
        tokio::select! {
          biased;
          _ = cancellation.cancelled() => break,
          record = ingress_rx.recv() => {
            let Some(record) = record else { break };
            let work = parser.parse(record);
            match state.handle(work) {
              HandlerResult::Forward(items) => {
                for item in items {
                  if out_tx.send(item).await.is_err() {
                    return;
                  }
                }
              }
              HandlerResult::Respond(record) => dispatcher.dispatch(record).await,
            }
          }
        }
      }
    }
    .instrument(info_span!("handler")),
  )
}

#[cfg(test)]
mod tests {
  use std::sync::Arc as StdArc;

  use runlog_core::settings::Settings;
  use runlog_proto::{Control, PartialHistoryAction, PartialHistoryRecord, ResponseRecord, RunBranch, RunRecord, Value};

  use super::*;
  use crate::collab::{FileStreamUpdate, fake::FakeCollaborators};

  fn collaborators(fake: StdArc<FakeCollaborators>) -> Collaborators {
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
      config: Default::default(),
      branch: RunBranch::default(),
      start_time_unix_ms: 0,
    }
  }

  /// A minimal run: Run -> PartialHistory(flush) -> Exit. The initial Run
  /// upsert replies with the run itself, the history reaches the
  /// file-stream with `_step`/`_runtime`/`loss`, and the stream finishes
  /// with exactly one exit response.
  #[tokio::test(flavor = "multi_thread")]
  async fn minimal_history_scenario_reaches_the_file_stream_and_exits_once() {
    let dir = tempfile::tempdir().unwrap();
    let fake = StdArc::new(FakeCollaborators::default());
    let settings = StdArc::new(Settings::default());

    let stream = Stream::start(settings, "client-1", &dir.path().join("log.bin"), collaborators(fake.clone())).unwrap();

    let (conn_tx, mut conn_rx) = mpsc::channel(16);
    stream.add_responder("conn-1", conn_tx);

    let control = Control { connection_id: Some("conn-1".into()), req_resp: true, ..Default::default() };
    stream.handle_record(Record::new(RecordKind::Run(run_record())).with_control(control.clone())).await.unwrap();

    let run_reply = conn_rx.recv().await.unwrap();
    assert!(matches!(run_reply.kind, RecordKind::Response(ResponseRecord::Run(_))));

    stream
      .handle_record(Record::new(RecordKind::PartialHistory(PartialHistoryRecord {
        items: vec![(vec!["loss".into()], Value::Float(1.0))],
        step: Some(0),
        action: PartialHistoryAction::Flush,
      })))
      .await
      .unwrap();

    stream
      .handle_record(Record::new(RecordKind::Exit(ExitRecord { exit_code: 0 })).with_control(control))
      .await
      .unwrap();

    let exit_reply = conn_rx.recv().await.unwrap();
    assert!(matches!(exit_reply.kind, RecordKind::Response(ResponseRecord::ExitResult { exit_code: Some(0) })));
    assert!(conn_rx.try_recv().is_err(), "at most one exit response is ever sent");

    stream.finish_and_close(Some(0)).await;

    let state = fake.state.lock().unwrap();
    assert_eq!(state.upserts.len(), 1);
    assert_eq!(state.upserts[0].entity, "e");
    assert_eq!(state.upserts[0].project, "p");
    assert_eq!(state.finished_with_exit, Some(0));
    assert!(state.stream_updates.iter().any(|u| match u {
      FileStreamUpdate::History(json) => json.get("step") == Some(&serde_json::json!(0)),
      _ => false,
    }));
  }

  /// With `offline=true`, Run/History/Exit are still appended to the log
  /// and the client still gets an exit response, but no GraphQL calls are
  /// issued.
  #[tokio::test(flavor = "multi_thread")]
  async fn offline_exit_scenario_appends_to_the_log_without_graphql_calls() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("log.bin");
    let fake = StdArc::new(FakeCollaborators::default());
    let mut settings = Settings::default();
    settings.offline = true;
    let settings = StdArc::new(settings);

    let stream = Stream::start(settings, "client-1", &log_path, collaborators(fake.clone())).unwrap();

    let (conn_tx, mut conn_rx) = mpsc::channel(16);
    stream.add_responder("conn-1", conn_tx);

    let control = Control { connection_id: Some("conn-1".into()), req_resp: true, ..Default::default() };
    stream.handle_record(Record::new(RecordKind::Run(run_record())).with_control(control.clone())).await.unwrap();

    stream
      .handle_record(Record::new(RecordKind::PartialHistory(PartialHistoryRecord {
        items: vec![(vec!["loss".into()], Value::Float(1.0))],
        step: Some(0),
        action: PartialHistoryAction::Flush,
      })))
      .await
      .unwrap();

    stream
      .handle_record(Record::new(RecordKind::Exit(ExitRecord { exit_code: 0 })).with_control(control))
      .await
      .unwrap();

    let exit_reply = conn_rx.recv().await.unwrap();
    assert!(matches!(exit_reply.kind, RecordKind::Response(ResponseRecord::ExitResult { exit_code: Some(0) })));

    stream.finish_and_close(Some(0)).await;

    {
      let state = fake.state.lock().unwrap();
      assert!(state.upserts.is_empty(), "offline mode must not issue GraphQL upserts");
    }

    // The log itself still holds the run, history, and exit records
    // (offline mode only gates the Sender's remote I/O, not durability).
    let mut reader = LogReader::open(&log_path).unwrap();
    let mut count = 0;
    while reader.next_record().unwrap().is_some() {
      count += 1;
    }
    assert_eq!(count, 3, "run, history, and exit records were all appended to the log");
  }
}
