//! FlowControl: the unbounded logical buffer between Writer and Sender.

use std::{
  collections::VecDeque,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use runlog_proto::Record;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::{
  log::{LogError, LogReader},
  parser::RecordParser,
  work::MaybeSavedWork,
  writer::WriterHandle,
};

#[derive(Debug, thiserror::Error)]
pub enum FlowControlError {
  #[error("log error during reload: {0}")]
  Log(#[from] LogError),
  #[error("record deserialization failed during reload: {0}")]
  Decode(#[from] serde_json::Error),
  #[error("chunk ended unexpectedly at record {expected}")]
  UnexpectedEof { expected: u64 },
  #[error("record number mismatch during reload: expected {expected}, found {actual:?}")]
  NumberMismatch { expected: u64, actual: Option<u64> },
  #[error("downstream channel closed")]
  Closed,
}

/// The sum type of what lives in the buffer: an in-memory `Work`, or a
/// reference to a run of already-saved records on disk.
#[derive(Debug)]
enum FlowItem {
  Work(MaybeSavedWork),
  SavedChunk { initial_offset: u64, initial_number: u64, count: u64 },
}

/// Pure, synchronous buffer logic, kept separate from the async
/// task plumbing so the `Add`/`Get` rules are unit-testable in isolation.
#[derive(Debug)]
struct FlowControlBuffer {
  items: VecDeque<FlowItem>,
  in_memory_size: usize,
  in_memory_count: usize,
  backed_up_count: u64,
  offloading_disabled: bool,
}

impl FlowControlBuffer {
  fn new(in_memory_size: usize) -> Self {
    Self {
      items: VecDeque::new(),
      in_memory_size,
      in_memory_count: 0,
      backed_up_count: 0,
      offloading_disabled: false,
    }
  }

  /// Add(maybe_saved) rules.
  fn add(&mut self, maybe: MaybeSavedWork) {
    let not_backed_up = self.backed_up_count == 0;
    let under_soft_cap = self.in_memory_count < self.in_memory_size;
    let keep_in_memory = !maybe.is_saved || self.offloading_disabled || (under_soft_cap && not_backed_up);

    if keep_in_memory {
      self.in_memory_count += 1;
      self.items.push_back(FlowItem::Work(maybe));
      return;
    }

    let record_number = maybe.record_number.expect("offloaded work is always saved and numbered");
    let offset = maybe.saved_offset.expect("offloaded work is always saved and numbered");

    if self.backed_up_count == 0 {
      warn!(record_number, "flow control backing up: sender falling behind, offloading saved work to log");
    }
    self.backed_up_count += 1;

    if let Some(FlowItem::SavedChunk { initial_number, count, .. }) = self.items.back_mut() {
      if *initial_number + *count == record_number {
        *count += 1;
        return;
      }
    }
    self.items.push_back(FlowItem::SavedChunk {
      initial_offset: offset,
      initial_number: record_number,
      count: 1,
    });
  }

  /// Get() pops from the head. When called on an empty buffer,
  /// it resets backed_up_count to 0 (the 'unblocked' transition).
  fn get(&mut self) -> Option<FlowItem> {
    if self.items.is_empty() {
      self.backed_up_count = 0;
      return None;
    }
    let item = self.items.pop_front().unwrap();
    if let FlowItem::Work(_) = &item {
      self.in_memory_count -= 1;
    }
    Some(item)
  }

  fn stop_offloading(&mut self) {
    self.offloading_disabled = true;
  }

  fn in_memory_len(&self) -> usize {
    self.in_memory_count
  }

  fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

/// Handle for the Writer stage to push `MaybeSavedWork` into FlowControl.
#[derive(Clone)]
pub struct FlowControlHandle {
  tx: mpsc::Sender<MaybeSavedWork>,
}

impl FlowControlHandle {
  pub async fn send(&self, item: MaybeSavedWork) -> Result<(), FlowControlError> {
    self.tx.send(item).await.map_err(|_| FlowControlError::Closed)
  }
}

/// Spawns FlowControl's producer (drains the Writer's output into the
/// buffer) and consumer (`Do`) tasks. Returns a handle for the
/// Writer side, the consumer's output receiver for the Sender side, and a
/// clone of the output sender so the Sender's flush barrier
/// can inject a sentinel into the very queue it drains — the same runwork
/// channel the finish task pushes onto.
pub fn spawn(
  in_memory_size: usize,
  channel_limit: usize,
  reader: LogReader,
  writer: WriterHandle,
  cancellation: CancellationToken,
) -> (
  FlowControlHandle,
  mpsc::Receiver<MaybeSavedWork>,
  mpsc::Sender<MaybeSavedWork>,
  tokio::task::JoinHandle<()>,
  tokio::task::JoinHandle<()>,
) {
  let (in_tx, in_rx) = mpsc::channel(channel_limit);
  let (out_tx, out_rx) = mpsc::channel(channel_limit);

  let buffer = Arc::new(Mutex::new(FlowControlBuffer::new(in_memory_size)));
  let notify = Arc::new(Notify::new());
  let upstream_done = Arc::new(AtomicBool::new(false));

  let producer = tokio::spawn(
    producer_task(in_rx, buffer.clone(), notify.clone(), upstream_done.clone(), cancellation.clone())
      .instrument(info_span!("flow_control_producer")),
  );
  let consumer = tokio::spawn(
    consumer_task(buffer, notify, upstream_done, out_tx.clone(), reader, writer, cancellation)
      .instrument(info_span!("flow_control_consumer")),
  );

  (FlowControlHandle { tx: in_tx }, out_rx, out_tx, producer, consumer)
}

async fn producer_task(
  mut rx: mpsc::Receiver<MaybeSavedWork>,
  buffer: Arc<Mutex<FlowControlBuffer>>,
  notify: Arc<Notify>,
  upstream_done: Arc<AtomicBool>,
  cancellation: CancellationToken,
) {
  loop {
    tokio::select! {
      biased;
      _ = cancellation.cancelled() => break,
      item = rx.recv() => {
        match item {
          Some(item) => {
            buffer.lock().await.add(item);
            notify.notify_one();
          }
          None => break,
        }
      }
    }
  }
  upstream_done.store(true, Ordering::SeqCst);
  notify.notify_one();
}

async fn consumer_task(
  buffer: Arc<Mutex<FlowControlBuffer>>,
  notify: Arc<Notify>,
  upstream_done: Arc<AtomicBool>,
  out_tx: mpsc::Sender<MaybeSavedWork>,
  mut reader: LogReader,
  writer: WriterHandle,
  cancellation: CancellationToken,
) {
  let mut parser = RecordParser::resumed(true);

  loop {
    let next = buffer.lock().await.get();
    match next {
      Some(FlowItem::Work(work)) => {
        if out_tx.send(work).await.is_err() {
          break;
        }
      }
      Some(FlowItem::SavedChunk { initial_offset, initial_number, count }) => {
        match reload_chunk(&mut reader, &writer, &mut parser, initial_offset, initial_number, count).await {
          Ok(reloaded) => {
            for item in reloaded {
              if out_tx.send(item).await.is_err() {
                return;
              }
            }
          }
          Err(err) => {
            warn!(
              error = %err,
              initial_number,
              count,
              "failed reading offloaded chunk from transaction log; disabling further offloading"
            );
            buffer.lock().await.stop_offloading();
          }
        }
      }
      None => {
        if upstream_done.load(Ordering::SeqCst) && buffer.lock().await.is_empty() {
          break;
        }
        if cancellation.is_cancelled() {
          break;
        }
        tokio::select! {
          _ = notify.notified() => {}
          _ = cancellation.cancelled() => break,
        }
      }
    }
  }
  debug!("flow control consumer exiting");
}

/// Do()... For SavedChunk items it calls writer.flush(), then
/// reader.seek(initial_offset), then reads count records sequentially.
/// Each read record is re-parsed through the RecordParser.
async fn reload_chunk(
  reader: &mut LogReader,
  writer: &WriterHandle,
  parser: &mut RecordParser,
  initial_offset: u64,
  initial_number: u64,
  count: u64,
) -> Result<Vec<MaybeSavedWork>, FlowControlError> {
  writer.flush().await?;
  reader.seek(initial_offset)?;

  let mut out = Vec::with_capacity(count as usize);
  for k in 0..count {
    let expected_number = initial_number + k;
    let offset_hint = reader.position();
    let bytes = reader.next_record()?.ok_or(FlowControlError::UnexpectedEof { expected: expected_number })?;
    let record: Record = serde_json::from_slice(&bytes)?;
    if record.num != Some(expected_number) {
      return Err(FlowControlError::NumberMismatch { expected: expected_number, actual: record.num });
    }
    let work = parser.parse(record);
    out.push(MaybeSavedWork::saved(work, offset_hint, expected_number));
  }
  Ok(out)
}
