//! The newline-delimited JSON front door `runlogd run` speaks on stdin and
//! stdout. Standing in for the process-boundary IPC transport the core
//! pipeline treats as an external collaborator — every `Stream`'s own
//! channels still do the actual work, this is only the outermost wire.
//!
//! A client wanting a reply to a submitted [`Record`] must set
//! `record.control.connection_id` to `"stdout"`; that is the one responder
//! every started run registers (see `main::handle_ingress_line`).

use runlog_core::RunId;
use runlog_proto::Record;
use serde::{Deserialize, Serialize};

/// One line of stdin.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IngressLine {
  /// Start a new run keyed by `run_id`, writing its transaction log under
  /// `<log_dir>/<client_id>.bin`.
  Start { run_id: String, client_id: String },
  /// Submit one record to an already-started run.
  Record { run_id: String, record: Record },
  /// Synthesize an exit (or `RunFinishWithoutExit` if `exit_code` is absent)
  /// and wind the run down via `finish_and_close`.
  Finish {
    run_id: String,
    #[serde(default)]
    exit_code: Option<i32>,
  },
}

impl IngressLine {
  pub fn run_id(&self) -> RunId {
    match self {
      IngressLine::Start { run_id, .. } | IngressLine::Record { run_id, .. } | IngressLine::Finish { run_id, .. } => RunId::new(run_id.clone()),
    }
  }
}

/// One line of stdout: a reply addressed back to the run that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct EgressLine {
  pub run_id: String,
  pub record: Record,
}

#[cfg(test)]
mod tests {
  use runlog_proto::RecordKind;

  use super::*;

  #[test]
  fn start_line_round_trips() {
    let json = r#"{"op":"start","run_id":"r1","client_id":"c1"}"#;
    let line: IngressLine = serde_json::from_str(json).unwrap();
    assert_eq!(line.run_id(), RunId::new("r1"));
    assert!(matches!(line, IngressLine::Start { client_id, .. } if client_id == "c1"));
  }

  #[test]
  fn finish_line_without_exit_code_parses() {
    let json = r#"{"op":"finish","run_id":"r1","exit_code":null}"#;
    let line: IngressLine = serde_json::from_str(json).unwrap();
    assert!(matches!(line, IngressLine::Finish { exit_code: None, .. }));
  }

  #[test]
  fn egress_line_serializes_with_run_id() {
    let line = EgressLine {
      run_id: "r1".into(),
      record: Record::new(RecordKind::Footer),
    };
    let json = serde_json::to_string(&line).unwrap();
    assert!(json.contains("\"run_id\":\"r1\""));
  }
}
