//! The Handler stage: partial-history aggregation, the
//! authoritative summary, metric definitions, run timing, and local request
//! servicing.

use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use runlog_core::settings::Settings;
use runlog_proto::{
  Control, HistoryRecord, MetricDefinition, PartialHistoryAction, PartialHistoryRecord, Record, RecordKind, RequestKind, ResponseRecord,
  RunRecord, Value,
};
use tracing::{debug, warn};

use crate::{
  collab::{OperationsTracker, SystemMonitor, TerminalPrinter},
  history::{RunHistory, SampledHistoryBuffer},
  summary::{MetricHandler, RunSummary},
  work::{ExitWork, Work},
};

/// What the Handler decided to do with one `Work` item.
pub enum HandlerResult {
  /// Forward these items to the Writer. Usually one (the input, possibly
  /// mutated); partial-history flushes turn into zero, one, or two derived
  /// `History` items instead of the original `PartialHistory` record.
  Forward(Vec<Work>),
  /// A locally-serviced request's reply, bound straight for the Dispatcher
  /// (never logged, never sent to the Sender).
  Respond(Record),
}

const POLL_EXIT_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Stamped onto every `Header` record the Handler sees (Header:
/// stamp producer/min-consumer version and forward).
const PRODUCER_VERSION: &str = concat!("runlog/", env!("CARGO_PKG_VERSION"));
const MIN_CONSUMER_VERSION: &str = "0.1.0";

/// Per-step accumulator plus the non-shared step counter.
struct PartialHistoryAccumulator {
  step: u64,
  current: RunHistory,
}

impl PartialHistoryAccumulator {
  fn new() -> Self {
    Self {
      step: 0,
      current: RunHistory::new(0),
    }
  }
}

pub struct HandlerState {
  settings: Arc<Settings>,
  client_id: String,
  summary: RunSummary,
  metrics: MetricHandler,
  partial: PartialHistoryAccumulator,
  sampled_history: SampledHistoryBuffer,
  initial_run: Option<RunRecord>,
  run_started_at: Option<Instant>,
  paused_since: Option<Instant>,
  paused_total: Duration,
  exited: bool,
  last_poll_exit_log: Option<Instant>,
  system_monitor: Arc<dyn SystemMonitor>,
  terminal_printer: Arc<dyn TerminalPrinter>,
  operations_tracker: Arc<dyn OperationsTracker>,
}

impl HandlerState {
  pub fn new(
    settings: Arc<Settings>,
    client_id: impl Into<String>,
    system_monitor: Arc<dyn SystemMonitor>,
    terminal_printer: Arc<dyn TerminalPrinter>,
    operations_tracker: Arc<dyn OperationsTracker>,
  ) -> Self {
    Self {
      settings,
      client_id: client_id.into(),
      summary: RunSummary::default(),
      metrics: MetricHandler::default(),
      partial: PartialHistoryAccumulator::new(),
      sampled_history: SampledHistoryBuffer::new(),
      initial_run: None,
      run_started_at: None,
      paused_since: None,
      paused_total: Duration::ZERO,
      exited: false,
      last_poll_exit_log: None,
      system_monitor,
      terminal_printer,
      operations_tracker,
    }
  }

  pub fn summary(&self) -> &RunSummary {
    &self.summary
  }

  fn elapsed_runtime_seconds(&self) -> f64 {
    let Some(started) = self.run_started_at else { return 0.0 };
    let paused = self.paused_since.map(|since| since.elapsed()).unwrap_or_default();
    (started.elapsed().saturating_sub(self.paused_total).saturating_sub(paused)).as_secs_f64()
  }

  /// Dispatches one `Work` item by the record type it carries.
  pub fn handle(&mut self, work: Work) -> HandlerResult {
    if let Work::Sentinel(_) = work {
      return HandlerResult::Forward(vec![work]);
    }

    let Some(record) = work.record().cloned() else {
      return HandlerResult::Forward(vec![work]);
    };

    match &record.kind {
      RecordKind::Header(_) => {
        debug!("received header record");
        let mut work = work;
        if let Some(Record { kind: RecordKind::Header(header), .. }) = work.record_mut() {
          header.producer_version = PRODUCER_VERSION.to_string();
          header.min_consumer_version = Some(MIN_CONSUMER_VERSION.to_string());
        }
        HandlerResult::Forward(vec![work])
      }

      RecordKind::Run(run) => {
        if self.initial_run.is_none() {
          self.initial_run = Some(run.clone());
          self.run_started_at = Some(Instant::now());
          self.system_monitor.start();
        }
        HandlerResult::Forward(vec![work])
      }

      RecordKind::PartialHistory(partial) => {
        let flushed = self.handle_partial_history(partial.clone());
        let mut forwarded = Vec::new();
        for history in flushed {
          forwarded.extend(self.expand_and_wrap_history(history));
        }
        HandlerResult::Forward(forwarded)
      }

      RecordKind::Summary(summary) => {
        for item in &summary.items {
          self.summary.apply_item(item);
        }
        HandlerResult::Forward(vec![work])
      }

      RecordKind::Metric(definition) => {
        if let Some(eager) = self.metrics.register(definition.clone()) {
          self.apply_eager_metric(&eager);
        }
        HandlerResult::Forward(vec![work])
      }

      RecordKind::Exit(exit) => {
        self.exited = true;
        self.pause_timer();
        self.system_monitor.finish();
        let runtime = self.elapsed_runtime_seconds();
        self.summary.set_runtime_seconds(runtime);
        let mut forwarded = self.flush_pending_history_always_send();
        forwarded.push(Work::Exit(ExitWork {
          record: record.clone(),
          exit: Some(exit.clone()),
        }));
        HandlerResult::Forward(forwarded)
      }

      RecordKind::RunFinishWithoutExit => {
        self.exited = true;
        self.pause_timer();
        self.system_monitor.finish();
        let runtime = self.elapsed_runtime_seconds();
        self.summary.set_runtime_seconds(runtime);
        let mut forwarded = self.flush_pending_history_always_send();
        forwarded.push(Work::Exit(ExitWork {
          record: record.clone(),
          exit: None,
        }));
        HandlerResult::Forward(forwarded)
      }

      RecordKind::Request(request) if request.is_local() => self.service_local_request(request, &record),

      RecordKind::Request(RequestKind::StopStatus) if self.settings.offline => HandlerResult::Respond(
        Record::new(RecordKind::Response(ResponseRecord::StopStatus { run_should_stop: false }))
          .with_control(echo_control(&record)),
      ),

      // Stats / Output / Alert / Artifact / Files / Telemetry / Preempting /
      // UseArtifact / Config, and every forwarded request: pass through
      // unchanged (no aggregation in Handler).
      _ => HandlerResult::Forward(vec![work]),
    }
  }

  fn pause_timer(&mut self) {
    if self.paused_since.is_none() {
      self.paused_since = Some(Instant::now());
    }
  }

  pub fn pause(&mut self) {
    self.pause_timer();
    self.system_monitor.pause();
  }

  pub fn resume(&mut self) {
    if let Some(since) = self.paused_since.take() {
      self.paused_total += since.elapsed();
    }
    self.system_monitor.resume();
  }

  /// Partial History bullet; see `crate::handler` module docs
  /// for the two-phase (step-advance, then explicit flush) model this
  /// implements.
  fn handle_partial_history(&mut self, partial: PartialHistoryRecord) -> Vec<HistoryRecord> {
    let mut out = Vec::new();

    if self.settings.x_shared {
      for (path, value) in partial.items {
        self.partial.current.set(path, value);
      }
      self.partial.current.set_client_id(self.client_id.clone());
      if matches!(partial.action, PartialHistoryAction::Flush) {
        out.push(self.flush_current(false));
      }
      return out;
    }

    match partial.step {
      Some(target) if target > self.partial.step => {
        out.push(self.flush_current(true));
        self.partial.step = target;
        self.partial.current = RunHistory::new(target);
        for (path, value) in partial.items {
          self.partial.current.set(path, value);
        }
      }
      Some(target) if target < self.partial.step => {
        warn!(target, current = self.partial.step, "partial history step regression rejected, request dropped");
        return out;
      }
      _ => {
        for (path, value) in partial.items {
          self.partial.current.set(path, value);
        }
      }
    }

    if matches!(partial.action, PartialHistoryAction::Flush) {
      out.push(self.flush_current(true));
    }
    out
  }

  /// Emits the current accumulator as a `HistoryRecord` and (in non-shared
  /// mode) advances the step counter.
  fn flush_current(&mut self, advance_step: bool) -> HistoryRecord {
    let next_step = if advance_step { self.partial.step + 1 } else { self.partial.step };
    let flushed = std::mem::replace(&mut self.partial.current, RunHistory::new(next_step));
    if advance_step {
      self.partial.step = next_step;
    }

    let runtime = self.elapsed_runtime_seconds();
    self.summary.set_runtime_seconds(runtime);

    let mut record = flushed.snapshot_to_record();
    record.items.push((vec!["_wandb".into(), "runtime".into()], Value::Float(runtime)));
    if !self.settings.x_shared {
      record.items.push((vec!["_step".into()], Value::Int(record.step as i64)));
    }
    // inserts step-metric cross-references: carry the x-axis
    // value along even if this flush only set the y-value.
    for (path, value) in self.metrics.step_metric_crossrefs(&record) {
      if !record.items.iter().any(|(p, _)| *p == path) {
        record.items.push((path, value));
      }
    }
    self.summary.apply_history(&record, self.metrics.definitions());
    self.sampled_history.record(&record);
    record
  }

  /// On exit, flushes any pending partial history with `always_send=true`
  /// so it still reaches the backend even if the run is offline.
  fn flush_pending_history_always_send(&mut self) -> Vec<Work> {
    if self.partial.current.is_empty() {
      return vec![];
    }
    let history = self.flush_current(!self.settings.x_shared);
    self.expand_and_wrap_history_with_control(history, Control { always_send: true, ..Default::default() })
  }

  fn expand_and_wrap_history(&mut self, history: HistoryRecord) -> Vec<Work> {
    self.expand_and_wrap_history_with_control(history, Control::default())
  }

  fn expand_and_wrap_history_with_control(&mut self, history: HistoryRecord, control: Control) -> Vec<Work> {
    let definitions = self.metrics.expand_for_history(&history);
    let mut out = Vec::with_capacity(1 + definitions.len());
    out.push(Work::generic(Record::new(RecordKind::History(history)).with_control(control)));
    for definition in definitions {
      out.push(Work::generic(Record::new(RecordKind::Metric(definition))));
    }
    out
  }

  fn apply_eager_metric(&mut self, definition: &MetricDefinition) {
    let path: Vec<String> = definition.name.split('.').map(str::to_string).collect();
    if let Some(existing) = self.summary.get(&path).cloned() {
      let synthetic = HistoryRecord {
        step: self.partial.step,
        items: vec![(path, existing)],
        client_id: None,
      };
      self.summary.apply_history(&synthetic, std::slice::from_ref(definition));
    }
  }

  fn service_local_request(&mut self, request: &RequestKind, record: &Record) -> HandlerResult {
    let control = echo_control(record);
    let response = match request {
      RequestKind::Attach => match &self.initial_run {
        Some(run) => ResponseRecord::Run(run.clone()),
        None => ResponseRecord::Error { message: "no run initialized yet".into() },
      },
      RequestKind::GetSummary => ResponseRecord::Summary(self.summary.to_record()),
      RequestKind::GetSystemMetrics => ResponseRecord::Stats(runlog_proto::StatsRecord {
        timestamp_unix_ms: 0,
        items: self.system_monitor.get_buffer(),
      }),
      RequestKind::InternalMessages => ResponseRecord::InternalMessages(self.terminal_printer.drain()),
      RequestKind::SampledHistory => ResponseRecord::SampledHistory(self.sampled_history.snapshot()),
      RequestKind::PollExit => {
        let now = Instant::now();
        let should_log = self.last_poll_exit_log.is_none_or(|last| now.duration_since(last) >= POLL_EXIT_LOG_INTERVAL);
        if should_log {
          self.last_poll_exit_log = Some(now);
          debug!("poll_exit");
        }
        ResponseRecord::PollExit(runlog_proto::PollExitRecord {
          done: self.exited,
          pending_operations: self.operations_tracker.snapshot(),
        })
      }
      RequestKind::Operations => ResponseRecord::Operations(self.operations_tracker.snapshot()),
      RequestKind::Pause => {
        self.pause();
        ResponseRecord::Ack
      }
      RequestKind::Resume => {
        self.resume();
        ResponseRecord::Ack
      }
      RequestKind::Cancel { .. } => ResponseRecord::Ack,
      RequestKind::Status => ResponseRecord::Ack,
      other => ResponseRecord::Error {
        message: format!("{other:?} is not a locally-serviced request"),
      },
    };
    HandlerResult::Respond(Record::new(RecordKind::Response(response)).with_control(control))
  }
}

fn echo_control(record: &Record) -> Control {
  Control {
    mailbox_slot: record.control.mailbox_slot.clone(),
    connection_id: record.control.connection_id.clone(),
    uuid: record.control.uuid,
    local: true,
    ..Default::default()
  }
}

#[cfg(test)]
mod tests {
  use runlog_proto::{MetricAggregation, PartialHistoryAction, PartialHistoryRecord};

  use super::*;

  fn handler() -> HandlerState {
    let fake = Arc::new(crate::collab::fake::FakeCollaborators::default());
    HandlerState::new(Arc::new(Settings::default()), "client-1", fake.clone(), fake.clone(), fake)
  }

  fn partial(step: Option<u64>, action: PartialHistoryAction, items: Vec<(&str, Value)>) -> PartialHistoryRecord {
    PartialHistoryRecord {
      items: items.into_iter().map(|(k, v)| (vec![k.to_string()], v)).collect(),
      step,
      action,
    }
  }

  #[test]
  fn run_record_starts_monitor_and_exit_finishes_it() {
    use crate::collab::fake::FakeCollaborators;
    let monitor = Arc::new(FakeCollaborators::default());
    let mut h = HandlerState::new(Arc::new(Settings::default()), "client-1", monitor.clone(), monitor.clone(), monitor.clone());

    let run = RunRecord {
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
      branch: Default::default(),
      start_time_unix_ms: 0,
    };
    h.handle(Work::generic(Record::new(RecordKind::Run(run))));
    assert!(monitor.state.lock().unwrap().monitor_started);

    h.handle(Work::generic(Record::new(RecordKind::RunFinishWithoutExit)));
    assert!(monitor.state.lock().unwrap().monitor_finished);
  }

  #[test]
  fn pause_and_resume_requests_propagate_to_the_system_monitor() {
    use crate::collab::fake::FakeCollaborators;
    let monitor = Arc::new(FakeCollaborators::default());
    let mut h = HandlerState::new(Arc::new(Settings::default()), "client-1", monitor.clone(), monitor.clone(), monitor.clone());
    h.pause();
    h.resume();
    let state = monitor.state.lock().unwrap();
    assert_eq!(state.monitor_paused, 1);
    assert_eq!(state.monitor_resumed, 1);
  }

  #[test]
  fn internal_messages_and_operations_requests_consult_their_collaborators() {
    use crate::collab::fake::FakeCollaborators;
    let fake = Arc::new(FakeCollaborators::default());
    fake.seed_terminal_lines(vec!["warning: something".into()]);
    fake.seed_operations(vec!["op-1".into()]);
    let mut h = HandlerState::new(Arc::new(Settings::default()), "client-1", fake.clone(), fake.clone(), fake);

    let HandlerResult::Respond(reply) =
      h.service_local_request(&RequestKind::InternalMessages, &Record::new(RecordKind::Request(RequestKind::InternalMessages)))
    else {
      panic!("expected a local response");
    };
    let RecordKind::Response(ResponseRecord::InternalMessages(lines)) = reply.kind else {
      panic!("expected InternalMessages response");
    };
    assert_eq!(lines, vec!["warning: something".to_string()]);

    let HandlerResult::Respond(reply) =
      h.service_local_request(&RequestKind::Operations, &Record::new(RecordKind::Request(RequestKind::Operations)))
    else {
      panic!("expected a local response");
    };
    let RecordKind::Response(ResponseRecord::Operations(ops)) = reply.kind else {
      panic!("expected Operations response");
    };
    assert_eq!(ops, vec!["op-1".to_string()]);
  }

  #[test]
  fn get_system_metrics_snapshots_the_monitor_buffer() {
    use crate::collab::fake::FakeCollaborators;
    let fake = Arc::new(FakeCollaborators::default());
    let mut h = HandlerState::new(Arc::new(Settings::default()), "client-1", fake.clone(), fake.clone(), fake);

    let HandlerResult::Respond(reply) =
      h.service_local_request(&RequestKind::GetSystemMetrics, &Record::new(RecordKind::Request(RequestKind::GetSystemMetrics)))
    else {
      panic!("expected a local response");
    };
    let RecordKind::Response(ResponseRecord::Stats(stats)) = reply.kind else {
      panic!("expected Stats response");
    };
    assert_eq!(stats.items, vec![("cpu".to_string(), 0.0)]);
  }

  #[test]
  fn header_record_is_stamped_with_producer_and_min_consumer_version() {
    let mut h = handler();
    let work = Work::generic(Record::new(RecordKind::Header(runlog_proto::HeaderRecord {
      producer_version: "sdk-whatever".into(),
      min_consumer_version: None,
    })));
    let HandlerResult::Forward(forwarded) = h.handle(work) else {
      panic!("expected the header to be forwarded");
    };
    let RecordKind::Header(header) = &forwarded[0].record().unwrap().kind else {
      panic!("expected a Header record");
    };
    assert_eq!(header.producer_version, PRODUCER_VERSION);
    assert_eq!(header.min_consumer_version.as_deref(), Some(MIN_CONSUMER_VERSION));
  }

  #[test]
  fn same_step_flush_merges_and_emits_once() {
    let mut h = handler();
    let flushed = h.handle_partial_history(partial(Some(0), PartialHistoryAction::Flush, vec![("loss", Value::Float(1.0))]));
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].step, 0);
    assert_eq!(h.partial.step, 1);
  }

  #[test]
  fn greater_step_emits_previous_and_advances_then_rejects_a_later_regression() {
    let mut h = handler();
    let flushed = h.handle_partial_history(partial(Some(5), PartialHistoryAction::Flush, vec![("loss", Value::Float(1.0))]));
    // Old (empty) step-0 accumulator plus the freshly-flushed step 5.
    assert_eq!(flushed.len(), 2);
    assert_eq!(h.partial.step, 6);

    // A lesser step is rejected; step counter is untouched.
    let rejected = h.handle_partial_history(partial(Some(3), PartialHistoryAction::Flush, vec![("loss", Value::Float(9.0))]));
    assert!(rejected.is_empty());
    assert_eq!(h.partial.step, 6);
  }

  #[test]
  fn shared_mode_tags_client_id_and_omits_step() {
    let mut h = handler();
    h.settings = Arc::new(Settings {
      x_shared: true,
      ..Settings::default()
    });
    let flushed = h.handle_partial_history(partial(None, PartialHistoryAction::Flush, vec![("loss", Value::Float(1.0))]));
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].client_id.as_deref(), Some("client-1"));
    assert!(!flushed[0].items.iter().any(|(p, _)| p == &vec!["_step".to_string()]));
  }

  #[test]
  fn summary_runtime_never_regresses_across_flushes() {
    let mut h = handler();
    h.run_started_at = Some(Instant::now());
    h.handle_partial_history(partial(Some(0), PartialHistoryAction::Flush, vec![("loss", Value::Float(1.0))]));
    let first = h.summary.runtime_seconds().unwrap();
    std::thread::sleep(Duration::from_millis(5));
    h.handle_partial_history(partial(Some(1), PartialHistoryAction::Flush, vec![("loss", Value::Float(2.0))]));
    let second = h.summary.runtime_seconds().unwrap();
    assert!(second >= first);
  }

  #[test]
  fn eager_metric_definition_backfills_existing_summary_value() {
    let mut h = handler();
    h.handle_partial_history(partial(Some(0), PartialHistoryAction::Flush, vec![("acc", Value::Float(0.9))]));
    h.handle(Work::generic(Record::new(RecordKind::Metric(MetricDefinition {
      name: "acc".into(),
      step_metric: None,
      aggregations: vec![MetricAggregation::Max],
      expand_glob: false,
    }))));
    assert!(h.summary.get(&vec!["acc.max".to_string()]).is_some());
  }

  #[test]
  fn step_metric_crossref_rides_along_when_only_y_is_flushed() {
    let mut h = handler();
    h.handle(Work::generic(Record::new(RecordKind::Metric(MetricDefinition {
      name: "custom/acc".into(),
      step_metric: Some("custom/step".into()),
      aggregations: vec![],
      expand_glob: false,
    }))));
    // First flush carries both the x and y values...
    let first = h.handle_partial_history(partial(
      Some(0),
      PartialHistoryAction::Flush,
      vec![("custom/acc", Value::Float(0.5)), ("custom/step", Value::Int(10))],
    ));
    assert_eq!(first.len(), 1);

    // ...a later flush that sends only the y-value still gets the x-value
    // attached by the cross-reference rule.
    let second = h.handle_partial_history(partial(Some(1), PartialHistoryAction::Flush, vec![("custom/acc", Value::Float(0.6))]));
    assert_eq!(second.len(), 1);
    assert!(second[0].items.iter().any(|(p, v)| p == &vec!["custom/step".to_string()] && *v == Value::Int(10)));
  }

  #[test]
  fn sampled_history_request_returns_flushed_points_not_the_live_accumulator() {
    let mut h = handler();
    h.handle_partial_history(partial(Some(0), PartialHistoryAction::Flush, vec![("loss", Value::Float(1.0))]));
    h.handle_partial_history(partial(Some(1), PartialHistoryAction::Flush, vec![("loss", Value::Float(2.0))]));
    // An unflushed in-progress value that must NOT show up in the sample.
    h.handle_partial_history(partial(None, PartialHistoryAction::Merge, vec![("loss", Value::Float(99.0))]));

    let HandlerResult::Respond(reply) = h.service_local_request(&RequestKind::SampledHistory, &Record::new(RecordKind::Request(RequestKind::SampledHistory)))
    else {
      panic!("expected a local response");
    };
    let RecordKind::Response(ResponseRecord::SampledHistory(points)) = reply.kind else {
      panic!("expected SampledHistory response");
    };
    assert_eq!(points.len(), 2);
    assert!(!points.iter().any(|p| p.items.iter().any(|(_, v)| *v == Value::Float(99.0))));
  }
}
