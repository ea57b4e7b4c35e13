//! `RecordParser`: maps a wire [`Record`] to a pipeline [`Work`] item
//!. Also used by FlowControl to re-parse records read back from
//! the transaction log (Do()... re-parsed through the
//! RecordParser).

use runlog_proto::{Record, RecordKind};

use crate::work::{ExitWork, GenericWork, RunUpdateWork, TbWork, Work};

/// Tracks whether the run's first `Run` record has already gone by, so a
/// later update is parsed as fire-and-forget rather than triggering the
/// init/branch-resolution path.
#[derive(Debug, Default)]
pub struct RecordParser {
  run_initialized: bool,
}

impl RecordParser {
  pub fn new() -> Self {
    Self::default()
  }

  /// Rebuild a parser that has already seen a run record, for use when
  /// FlowControl resumes reloading mid-log (the first `Run` record was
  /// necessarily before any saved chunk that follows it).
  pub fn resumed(run_initialized: bool) -> Self {
    Self { run_initialized }
  }

  pub fn parse(&mut self, record: Record) -> Work {
    match &record.kind {
      RecordKind::Run(run) => {
        let is_first_time = !self.run_initialized;
        self.run_initialized = true;
        let run = run.clone();
        Work::RunUpdate(RunUpdateWork { record, run, is_first_time })
      }
      RecordKind::Tbrecord { log_dir, root_dir } => {
        let (log_dir, root_dir) = (log_dir.clone(), root_dir.clone());
        Work::Tensorboard(TbWork { record, log_dir, root_dir })
      }
      RecordKind::Exit(exit) => {
        let exit = Some(exit.clone());
        Work::Exit(ExitWork { record, exit })
      }
      RecordKind::RunFinishWithoutExit => Work::Exit(ExitWork { record, exit: None }),
      _ => Work::Generic(GenericWork { record }),
    }
  }
}

#[cfg(test)]
mod tests {
  use runlog_proto::{Control, ExitRecord, RunBranch, RunRecord};

  use super::*;

  fn run_record() -> Record {
    Record::new(RecordKind::Run(RunRecord {
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
    }))
  }

  #[test]
  fn first_run_record_is_first_time_subsequent_are_not() {
    let mut parser = RecordParser::new();
    let Work::RunUpdate(first) = parser.parse(run_record()) else {
      panic!("expected RunUpdate")
    };
    assert!(first.is_first_time);

    let Work::RunUpdate(second) = parser.parse(run_record()) else {
      panic!("expected RunUpdate")
    };
    assert!(!second.is_first_time);
  }

  #[test]
  fn exit_and_finish_without_exit_both_parse_to_exit_work() {
    let mut parser = RecordParser::new();
    let Work::Exit(exit) = parser.parse(Record::new(RecordKind::Exit(ExitRecord { exit_code: 0 }))) else {
      panic!("expected Exit")
    };
    assert_eq!(exit.exit.unwrap().exit_code, 0);

    let Work::Exit(finish) = parser.parse(Record::new(RecordKind::RunFinishWithoutExit)) else {
      panic!("expected Exit")
    };
    assert!(finish.exit.is_none());
  }

  #[test]
  fn requests_fall_through_to_generic() {
    let mut parser = RecordParser::new();
    let work = parser.parse(Record::new(RecordKind::Request(runlog_proto::RequestKind::Status)).with_control(Control::default()));
    assert!(matches!(work, Work::Generic(_)));
  }
}
