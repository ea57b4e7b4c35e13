//! Common test utilities for pipeline integration tests.
//!
//! These exercise the end-to-end scenarios named in the run-ingestion
//! pipeline's design (Handler -> Writer -> FlowControl -> Sender, wired
//! through `Stream`), backed by the in-process fake collaborators rather
//! than a real network backend.

use std::sync::Arc;

use runlog_pipeline::{collab::fake::FakeCollaborators, sender::Collaborators};
use runlog_proto::{ConfigRecord, RunBranch, RunRecord};

#[allow(dead_code)]
pub fn collaborators(fake: Arc<FakeCollaborators>) -> Collaborators {
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

#[allow(dead_code)]
pub fn run_record() -> RunRecord {
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
