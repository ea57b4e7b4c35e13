//! The Writer stage: assigns record numbers, persists to the transaction
//! log, and forwards `MaybeSavedWork`.

use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
};

use runlog_proto::Record;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span, warn};

use crate::{
  BUFFER_SIZE,
  flow_control::FlowControlHandle,
  log::{LogError, LogWriter},
  work::{MaybeSavedWork, Work},
};

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
  #[error("transaction log error: {0}")]
  Log(#[from] LogError),
  #[error("failed to serialize record: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("store-writer task is gone")]
  Closed,
}

enum StoreMsg {
  Append { payload: Vec<u8>, respond_to: oneshot::Sender<Result<u64, LogError>> },
  Flush { respond_to: oneshot::Sender<Result<(), LogError>> },
}

/// Cheap-to-clone handle onto the dedicated store-writer task that owns the
/// `LogWriter` exclusively (the transaction log is written by
/// exactly one task).
#[derive(Clone)]
pub struct WriterHandle {
  tx: mpsc::Sender<StoreMsg>,
}

impl WriterHandle {
  async fn append_bytes(&self, payload: Vec<u8>) -> Result<u64, WriterError> {
    let (respond_to, rx) = oneshot::channel();
    self.tx.send(StoreMsg::Append { payload, respond_to }).await.map_err(|_| WriterError::Closed)?;
    rx.await.map_err(|_| WriterError::Closed)?.map_err(WriterError::from)
  }

  /// the Writer exposes a flush() method... FlowControl calls
  /// this before reading back.
  pub async fn flush(&self) -> Result<(), LogError> {
    let (respond_to, rx) = oneshot::channel();
    if self.tx.send(StoreMsg::Flush { respond_to }).await.is_err() {
      return Ok(());
    }
    rx.await.unwrap_or(Ok(()))
  }
}

async fn store_writer_task(mut log: LogWriter, mut rx: mpsc::Receiver<StoreMsg>) {
  while let Some(msg) = rx.recv().await {
    match msg {
      StoreMsg::Append { payload, respond_to } => {
        let result = log.append(&payload);
        let _ = respond_to.send(result);
      }
      StoreMsg::Flush { respond_to } => {
        let result = log.flush();
        let _ = respond_to.send(result);
      }
    }
  }
}

/// Spawns the dedicated store-writer task; the queue is `8 * BufferSize`
///.
pub fn spawn_store_writer(log: LogWriter) -> (WriterHandle, tokio::task::JoinHandle<()>) {
  let (tx, rx) = mpsc::channel(8 * BUFFER_SIZE);
  let join = tokio::spawn(store_writer_task(log, rx).instrument(info_span!("store_writer")));
  (WriterHandle { tx }, join)
}

/// The Writer stage proper: record numbering + the offline forwarding gate
///.
pub struct Writer {
  record_counter: AtomicU64,
  offline: bool,
  store: WriterHandle,
}

impl Writer {
  pub fn new(store: WriterHandle, offline: bool) -> Self {
    Self {
      record_counter: AtomicU64::new(0),
      offline,
      store,
    }
  }

  pub async fn save(&self, mut work: Work) -> Result<Option<MaybeSavedWork>, WriterError> {
    if !work.is_loggable() {
      return Ok(self.gate_offline(MaybeSavedWork::unsaved(work)));
    }

    let record_number = self.record_counter.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(record) = work.record_mut() {
      record.num = Some(record_number);
    }
    let payload: Vec<u8> = {
      let record: &Record = work.record().expect("loggable work always carries a record");
      serde_json::to_vec(record)?
    };
    let offset = self.store.append_bytes(payload).await?;
    Ok(self.gate_offline(MaybeSavedWork::saved(work, offset, record_number)))
  }

  fn gate_offline(&self, maybe: MaybeSavedWork) -> Option<MaybeSavedWork> {
    if self.offline && !maybe.work.bypass_offline_mode() { None } else { Some(maybe) }
  }
}

/// Drains the Handler's output channel, running every `Work` through
/// [`Writer::save`] and forwarding the result into FlowControl.
pub async fn run_stage(mut rx: mpsc::Receiver<Work>, writer: Arc<Writer>, flow: FlowControlHandle, cancellation: CancellationToken) {
  loop {
    tokio::select! {
      biased;
      _ = cancellation.cancelled() => break,
      work = rx.recv() => {
        let Some(work) = work else { break };
        match writer.save(work).await {
          Ok(Some(maybe_saved)) => {
            if flow.send(maybe_saved).await.is_err() {
              break;
            }
          }
          Ok(None) => {}
          Err(err) => warn!(error = %err, "writer stage failed to persist a record"),
        }
      }
    }
  }
}
