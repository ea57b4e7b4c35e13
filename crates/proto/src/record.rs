use serde::{Deserialize, Serialize};

use crate::{
  control::Control,
  value::{MetricPath, Value},
};

/// Producer/consumer version stamp exchanged once per run at the start of
/// the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderRecord {
  pub producer_version: String,
  pub min_consumer_version: Option<String>,
}

/// Resume/fork/rewind branch selection; at most one is set, validated by
/// the Sender before the first upsert.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunBranch {
  pub resume: Option<String>,
  pub fork_from: Option<String>,
  pub resume_from: Option<String>,
}

impl RunBranch {
  pub fn selected_count(&self) -> usize {
    [&self.resume, &self.fork_from, &self.resume_from]
      .into_iter()
      .filter(|o| o.is_some())
      .count()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
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
  pub config: ConfigRecord,
  pub branch: RunBranch,
  pub start_time_unix_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
  pub updates: Vec<(MetricPath, Value)>,
  pub removes: Vec<MetricPath>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRecord {
  pub exit_code: i32,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
  pub step: u64,
  pub items: Vec<(MetricPath, Value)>,
  /// Set only in shared (multi-writer) mode, where the backend orders
  /// history by writer identity rather than by `step` (Shared).
  pub client_id: Option<String>,
}

/// What a `flush` action on a `PartialHistoryRecord` does once merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartialHistoryAction {
  /// Merge into the current accumulator; flush only if the accumulator asks for it.
  Merge,
  /// Force emission of the accumulator after merging this update.
  Flush,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialHistoryRecord {
  pub items: Vec<(MetricPath, Value)>,
  /// Target step; absent means "merge into current". Ignored entirely in shared mode.
  pub step: Option<u64>,
  pub action: PartialHistoryAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricAggregation {
  Min,
  Max,
  Mean,
  Last,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
  pub name: String,
  pub step_metric: Option<String>,
  pub aggregations: Vec<MetricAggregation>,
  pub expand_glob: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryItem {
  pub path: MetricPath,
  pub op: SummaryOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SummaryOp {
  Update(Value),
  Remove,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
  pub items: Vec<SummaryItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesRecord {
  pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
  pub path: String,
  pub policy: FilePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilePolicy {
  Now,
  End,
  Live,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
  pub artifact_id: String,
  pub artifact_type: String,
  pub name: String,
  pub digest: String,
  pub history_step: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
  pub timestamp_unix_ms: i64,
  pub items: Vec<(String, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
  pub line: String,
  pub raw: bool,
  pub is_stderr: bool,
  pub timestamp_unix_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
  pub items: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollExitRecord {
  pub done: bool,
  /// Operation-stats snapshot, combined with file-transfer progress and
  /// folded in alongside `done`.
  pub pending_operations: Vec<String>,
}

/// Payloads for requests the Handler or Sender services locally rather than
/// logging and uploading (Requests serviced locally). Kept as
/// its own sum type rather than overloading the ingress `RecordKind`
/// variants above, since a response never round-trips through the
/// transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseRecord {
  Run(RunRecord),
  Summary(SummaryRecord),
  Stats(StatsRecord),
  PollExit(PollExitRecord),
  SampledHistory(Vec<HistoryRecord>),
  Operations(Vec<String>),
  InternalMessages(Vec<String>),
  StopStatus { run_should_stop: bool },
  NetworkStatus { network_responses: Vec<String> },
  SyncFinish { run_url: Option<String> },
  /// Sent once the finish sequence completes, whether or not an exit code
  /// was ever observed.
  ExitResult { exit_code: Option<i32> },
  Ack,
  Error { message: String },
}

/// Requests serviced or forwarded by the Handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "params")]
pub enum RequestKind {
  // --- serviced locally, never forwarded ---
  Attach,
  GetSummary,
  GetSystemMetrics,
  InternalMessages,
  SampledHistory,
  PollExit,
  Operations,
  Pause,
  Resume,
  Cancel { mailbox_slot: String },
  Status,

  // --- forwarded to the Sender ---
  StopStatus,
  LogArtifact { artifact: ArtifactRecord, staging_dir: Option<String> },
  LinkArtifact { artifact_id: String, target: String },
  DownloadArtifact { artifact_id: String },
  NetworkStatus,
  SyncFinish,
  JobInput,
  RunStart,
  Shutdown,
}

impl RequestKind {
  /// Requests the Handler answers itself, without forwarding downstream.
  pub fn is_local(&self) -> bool {
    matches!(
      self,
      RequestKind::Attach
        | RequestKind::GetSummary
        | RequestKind::GetSystemMetrics
        | RequestKind::InternalMessages
        | RequestKind::SampledHistory
        | RequestKind::PollExit
        | RequestKind::Operations
        | RequestKind::Pause
        | RequestKind::Resume
        | RequestKind::Cancel { .. }
        | RequestKind::Status
    )
  }
}

/// The tagged union of everything a client can stream to the service
/// (Record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum RecordKind {
  Header(HeaderRecord),
  Run(RunRecord),
  Exit(ExitRecord),
  RunFinishWithoutExit,
  History(HistoryRecord),
  PartialHistory(PartialHistoryRecord),
  Summary(SummaryRecord),
  Config(ConfigRecord),
  Metric(MetricDefinition),
  Files(FilesRecord),
  Artifact(ArtifactRecord),
  UseArtifact { artifact_id: String },
  Stats(StatsRecord),
  Output(OutputRecord),
  Telemetry(TelemetryRecord),
  Preempting,
  Alert { title: String, text: String, level: String },
  Tbrecord { log_dir: String, root_dir: String },
  Footer,
  Request(RequestKind),
  Response(ResponseRecord),
}

/// A single framed unit of ingress: a [`RecordKind`] plus its [`Control`]
/// block. `num` is assigned by the Writer and is `None` until
/// the record has been through that stage (or forever, for `control.local`
/// records and for requests, which are never numbered).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub control: Control,
  pub num: Option<u64>,
  pub kind: RecordKind,
}

impl Record {
  pub fn new(kind: RecordKind) -> Self {
    Self {
      control: Control::default(),
      num: None,
      kind,
    }
  }

  pub fn with_control(mut self, control: Control) -> Self {
    self.control = control;
    self
  }

  /// Requests are never persisted to the transaction log (Skips requests).
  pub fn is_request(&self) -> bool {
    matches!(self.kind, RecordKind::Request(_))
  }
}
