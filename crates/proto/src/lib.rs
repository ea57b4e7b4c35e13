//! Wire types exchanged between the client SDK and the run-ingestion
//! service: [`Record`], its [`Control`] block, and the value model shared by
//! history and summary.

mod control;
mod record;
mod value;

pub use control::Control;
pub use record::{
  ArtifactRecord, ConfigRecord, ExitRecord, FileEntry, FilePolicy, FilesRecord, HeaderRecord, HistoryRecord,
  MetricAggregation, MetricDefinition, OutputRecord, PartialHistoryAction, PartialHistoryRecord, PollExitRecord,
  Record, RecordKind, RequestKind, ResponseRecord, RunBranch, RunRecord, StatsRecord, SummaryItem, SummaryOp,
  SummaryRecord, TelemetryRecord,
};
pub use value::{MetricPath, Value};
