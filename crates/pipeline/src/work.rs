//! The pipeline's unit of processing (Work).
//!
//! Per the design notes, `Work` is a closed enum dispatched with
//! `match` rather than a trait object: the variant set is fixed and small,
//! and every stage already needs to see the wrapped [`Record`] to do its
//! job, so a vtable buys nothing here.

use runlog_proto::{ExitRecord, Record, RunRecord};

/// A run-upsert in progress. Carries whether this is the run's first-ever
/// `Run` record (triggering the init/branch-resolution path) or a later
/// update (fire-and-forget).
#[derive(Debug, Clone)]
pub struct RunUpdateWork {
  pub record: Record,
  pub run: RunRecord,
  pub is_first_time: bool,
}

/// Wraps a `Tbrecord` (tensorboard ingestion).
#[derive(Debug, Clone)]
pub struct TbWork {
  pub record: Record,
  pub log_dir: String,
  pub root_dir: String,
}

/// An `Exit` or `RunFinishWithoutExit` record. `exit` is `None` for the
/// latter (RunFinishWithoutExit: same as exit but marks the
/// pipeline to complete without recording an exit to the backend).
#[derive(Debug, Clone)]
pub struct ExitWork {
  pub record: Record,
  pub exit: Option<ExitRecord>,
}

/// Everything else: forwarded unchanged, or a locally/forwarded request.
#[derive(Debug, Clone)]
pub struct GenericWork {
  pub record: Record,
}

/// A flush-barrier marker. Carries no record and is never logged, saved,
/// or dispatched anywhere —
/// its only effect is to make the Sender observe `tag` and wake waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentinelWork {
  pub tag: u64,
}

#[derive(Debug, Clone)]
pub enum Work {
  RunUpdate(RunUpdateWork),
  Tensorboard(TbWork),
  Exit(ExitWork),
  Generic(GenericWork),
  Sentinel(SentinelWork),
}

impl Work {
  pub fn generic(record: Record) -> Self {
    Work::Generic(GenericWork { record })
  }

  pub fn record(&self) -> Option<&Record> {
    match self {
      Work::RunUpdate(w) => Some(&w.record),
      Work::Tensorboard(w) => Some(&w.record),
      Work::Exit(w) => Some(&w.record),
      Work::Generic(w) => Some(&w.record),
      Work::Sentinel(_) => None,
    }
  }

  pub fn record_mut(&mut self) -> Option<&mut Record> {
    match self {
      Work::RunUpdate(w) => Some(&mut w.record),
      Work::Tensorboard(w) => Some(&mut w.record),
      Work::Exit(w) => Some(&mut w.record),
      Work::Generic(w) => Some(&mut w.record),
      Work::Sentinel(_) => None,
    }
  }

  /// Requests and `control.local` records are never persisted or numbered.
  pub fn is_loggable(&self) -> bool {
    match self.record() {
      Some(r) => !r.control.local && !r.is_request(),
      None => false,
    }
  }

  /// Whether this Work should reach the Sender even while offline. Run
  /// updates and exits carry their own opt-out: a run-update still needs to
  /// reach the Sender offline (to populate local run state and answer any
  /// `req_resp` caller), and an exit always owes the client a response.
  pub fn bypass_offline_mode(&self) -> bool {
    match self {
      Work::RunUpdate(_) | Work::Exit(_) => true,
      _ => self.record().map(|r| r.control.always_send).unwrap_or(false),
    }
  }

  pub fn sentinel_tag(&self) -> Option<u64> {
    match self {
      Work::Sentinel(s) => Some(s.tag),
      _ => None,
    }
  }

  pub fn is_exit(&self) -> bool {
    matches!(self, Work::Exit(_))
  }

  pub fn debug_info(&self) -> String {
    match self {
      Work::RunUpdate(w) => format!("run_update(first_time={}, run_id={})", w.is_first_time, w.run.run_id),
      Work::Tensorboard(w) => format!("tensorboard(log_dir={})", w.log_dir),
      Work::Exit(w) => format!("exit(code={:?})", w.exit.as_ref().map(|e| e.exit_code)),
      Work::Generic(w) => format!("generic({:?})", std::mem::discriminant(&w.record.kind)),
      Work::Sentinel(s) => format!("sentinel({})", s.tag),
    }
  }
}

/// The Writer's output: a Work item plus what happened to it durability-wise
/// (MaybeSavedWork).
#[derive(Debug, Clone)]
pub struct MaybeSavedWork {
  pub work: Work,
  pub is_saved: bool,
  pub saved_offset: Option<u64>,
  pub record_number: Option<u64>,
}

impl MaybeSavedWork {
  pub fn unsaved(work: Work) -> Self {
    Self {
      work,
      is_saved: false,
      saved_offset: None,
      record_number: None,
    }
  }

  pub fn saved(work: Work, saved_offset: u64, record_number: u64) -> Self {
    Self {
      work,
      is_saved: true,
      saved_offset: Some(saved_offset),
      record_number: Some(record_number),
    }
  }
}
