//! Collaborator contracts consumed by the core pipeline. Real
//! implementations (GraphQL over HTTP, the actual file-stream/file-transfer
//! protocols, git/code snapshotting) are out of scope here — only the trait
//! boundary and an in-process fake ([`fake`]) live in this crate.

pub mod fake;

use async_trait::async_trait;
use runlog_proto::{ArtifactRecord, FileEntry, FilesRecord};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
  #[error("remote call failed: {0}")]
  Remote(String),
  #[error("operation was cancelled")]
  Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertBucketRequest {
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
  pub config_json: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct UpsertBucketResponse {
  pub storage_id: String,
  pub entity: String,
  pub project: String,
  pub display_name: String,
  pub sweep_id: Option<String>,
  pub file_stream_offsets: std::collections::BTreeMap<String, u64>,
}

/// GraphQL client: synchronous upsert_bucket(...),
/// run_stopped_status(...), notify_alert(...), link_artifact(...) with
/// context-based cancellation and retries; returns structured results or
/// error. Nil when offline.
#[async_trait]
pub trait GraphQlClient: Send + Sync {
  async fn upsert_bucket(&self, req: UpsertBucketRequest, cancel: CancellationToken) -> Result<UpsertBucketResponse, CollabError>;
  async fn run_stopped_status(&self, entity: &str, project: &str, run_id: &str) -> Result<bool, CollabError>;
  async fn notify_alert(&self, title: &str, text: &str, level: &str) -> Result<(), CollabError>;
  async fn link_artifact(&self, artifact_id: &str, target: &str) -> Result<(), CollabError>;
}

#[derive(Debug, Clone)]
pub enum FileStreamUpdate {
  History(serde_json::Value),
  Summary(serde_json::Value),
  Stats(serde_json::Value),
  Console { line: String, is_stderr: bool },
  Preempting,
}

/// File-stream: start(...), stream_update(kind, payload) ...,
/// finish_with_exit(code), finish_without_exit().
#[async_trait]
pub trait FileStream: Send + Sync {
  async fn start(&self, entity: &str, project: &str, run_id: &str, offsets: std::collections::BTreeMap<String, u64>);
  async fn stream_update(&self, update: FileStreamUpdate);
  async fn finish_with_exit(&self, exit_code: i32);
  async fn finish_without_exit(&self);
}

/// File-transfer manager: accepts file-upload tasks; close() drains.
#[async_trait]
pub trait FileTransferManager: Send + Sync {
  async fn enqueue(&self, path: String);
  async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPolicy {
  Now,
  End,
  Live,
}

/// Runfiles uploader: process(files_record), upload_now(path,
/// kind), upload_remaining(), finish().
#[async_trait]
pub trait RunfilesUploader: Send + Sync {
  async fn process(&self, files: &FilesRecord);
  async fn upload_now(&self, path: &str, policy: UploadPolicy);
  async fn upload_remaining(&self);
  async fn finish(&self);
}

/// Artifacts saver: save(ctx, artifact, history_step,
/// staging_dir) -> result_chan.
#[async_trait]
pub trait ArtifactsSaver: Send + Sync {
  async fn save(&self, artifact: ArtifactRecord, history_step: Option<u64>, staging_dir: Option<String>) -> Result<(), CollabError>;
}

/// System monitor: start(), pause(), resume(), finish(),
/// get_buffer().
pub trait SystemMonitor: Send + Sync {
  fn start(&self);
  fn pause(&self);
  fn resume(&self);
  fn finish(&self);
  fn get_buffer(&self) -> Vec<(String, f64)>;
}

/// Non-draining snapshot of recent network call/response pairs, backing
/// `NetworkStatus` requests. Operations tracker and terminal printer below
/// are the other two observable-snapshot boundaries.
pub trait TelemetryPeeker: Send + Sync {
  fn snapshot(&self) -> Vec<(String, String)>;
}

pub trait OperationsTracker: Send + Sync {
  fn snapshot(&self) -> Vec<String>;
}

pub trait TerminalPrinter: Send + Sync {
  fn drain(&self) -> Vec<String>;
}

/// The file-entry policy carried on each `FileEntry` maps directly onto
/// [`UploadPolicy`].
pub fn upload_policy_for(entry: &FileEntry) -> UploadPolicy {
  match entry.policy {
    runlog_proto::FilePolicy::Now => UploadPolicy::Now,
    runlog_proto::FilePolicy::End => UploadPolicy::End,
    runlog_proto::FilePolicy::Live => UploadPolicy::Live,
  }
}

/// A tensorboard-ingest `Work` wraps the external TBHandler. The TBHandler
/// itself (parsing tfevents files) is out of scope; only the boundary the
/// Sender calls through lives here.
#[async_trait]
pub trait TensorboardHandler: Send + Sync {
  async fn ingest(&self, log_dir: &str, root_dir: &str);
}

/// `JobInput`/`UseArtifact` forward to the job-builder, which also builds
/// and uploads the "job" artifact during the finish sequence when configured.
#[async_trait]
pub trait JobBuilder: Send + Sync {
  async fn note_job_input(&self, artifact_id: Option<String>);
  /// Returns the built job artifact, if enough information (entrypoint,
  /// requirements, source) was ever collected to build one.
  async fn build(&self) -> Option<ArtifactRecord>;
}
