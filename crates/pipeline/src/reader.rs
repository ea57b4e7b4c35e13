//! Reader (sync mode): replays a transaction log into the pipeline as if
//! records had arrived from a live client.

use std::path::Path;

use runlog_proto::{Control, Record, RecordKind, RequestKind};
use tokio::sync::mpsc;

use crate::log::{LogError, LogReader};

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
  #[error("failed to open transaction log: {0}")]
  Open(#[from] LogError),
  #[error("failed to decode a record from the log: {0}")]
  Decode(#[from] serde_json::Error),
}

/// The entity/project/run-id the sync command is targeting, overlaid onto
/// whatever the logged `Run` record originally carried.
#[derive(Debug, Clone)]
pub struct RunIdentityOverlay {
  pub entity: String,
  pub project: String,
  pub run_id: String,
}

pub struct Reader {
  log: LogReader,
}

impl Reader {
  /// The log's header is validated on open; an invalid header
  /// aborts sync with an error.
  pub fn open(path: &Path) -> Result<Self, ReaderError> {
    Ok(Self { log: LogReader::open(path)? })
  }

  /// Replays every record in the log into `tx`, synthesizing a `RunStart`
  /// request right after the `Run` record (so downstream
  /// initializes collaborators identically to a live session).
  pub async fn run(mut self, overlay: RunIdentityOverlay, tx: mpsc::Sender<Record>) -> Result<(), ReaderError> {
    loop {
      let Some(bytes) = self.log.next_record()? else { break };
      let mut record: Record = serde_json::from_slice(&bytes)?;

      if let RecordKind::Run(run) = &mut record.kind {
        run.entity = overlay.entity.clone();
        run.project = overlay.project.clone();
        run.run_id = overlay.run_id.clone();

        if tx.send(record.clone()).await.is_err() {
          return Ok(());
        }
        let run_start = Record::new(RecordKind::Request(RequestKind::RunStart)).with_control(Control {
          local: true,
          ..Default::default()
        });
        if tx.send(run_start).await.is_err() {
          return Ok(());
        }
        continue;
      }

      if tx.send(record).await.is_err() {
        return Ok(());
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use runlog_proto::{ConfigRecord, ExitRecord, RunBranch, RunRecord};

  use super::*;
  use crate::log::LogWriter;

  fn run_record(entity: &str) -> Record {
    Record::new(RecordKind::Run(RunRecord {
      entity: entity.into(),
      project: "orig-project".into(),
      run_id: "orig-run".into(),
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
    }))
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn overlays_identity_and_synthesizes_run_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.bin");

    let mut writer = LogWriter::create(&path).unwrap();
    writer.append(&serde_json::to_vec(&run_record("orig-entity")).unwrap()).unwrap();
    writer
      .append(&serde_json::to_vec(&Record::new(RecordKind::Exit(ExitRecord { exit_code: 0 }))).unwrap())
      .unwrap();
    writer.flush().unwrap();

    let reader = Reader::open(&path).unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let overlay = RunIdentityOverlay {
      entity: "new-entity".into(),
      project: "new-project".into(),
      run_id: "new-run".into(),
    };
    reader.run(overlay, tx).await.unwrap();

    let first = rx.recv().await.unwrap();
    match first.kind {
      RecordKind::Run(run) => {
        assert_eq!(run.entity, "new-entity");
        assert_eq!(run.project, "new-project");
        assert_eq!(run.run_id, "new-run");
      }
      other => panic!("expected Run, got {other:?}"),
    }

    let second = rx.recv().await.unwrap();
    assert!(matches!(second.kind, RecordKind::Request(RequestKind::RunStart)));

    let third = rx.recv().await.unwrap();
    assert!(matches!(third.kind, RecordKind::Exit(_)));

    assert!(rx.recv().await.is_none());
  }

  #[tokio::test]
  async fn rejects_logs_with_bad_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.bin");
    std::fs::write(&path, b"not a log").unwrap();
    assert!(Reader::open(&path).is_err());
  }
}
