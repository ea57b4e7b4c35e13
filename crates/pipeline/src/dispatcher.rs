//! Dispatcher: fan-in of results to the right client responder,
//! plus the Mailbox used for request cancellation.

use dashmap::DashMap;
use runlog_proto::Record;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One registered client connection's reply channel.
#[derive(Clone)]
pub struct Responder {
  tx: mpsc::Sender<Record>,
}

impl Responder {
  pub fn new(tx: mpsc::Sender<Record>) -> Self {
    Self { tx }
  }
}

/// Keyed by `connection_id` (A registry of responders keyed by
/// connection id).
#[derive(Clone, Default)]
pub struct Dispatcher {
  responders: DashMap<String, Responder>,
}

impl Dispatcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, connection_id: impl Into<String>, responder: Responder) {
    self.responders.insert(connection_id.into(), responder);
  }

  pub fn unregister(&self, connection_id: &str) {
    self.responders.remove(connection_id);
  }

  /// Routes by `control.connection_id`; unknown ids are logged,
  /// missing ids are dropped silently (informational echoes).
  pub async fn dispatch(&self, record: Record) {
    let Some(connection_id) = record.control.connection_id.clone() else {
      debug!("dropping result with no connection_id (informational echo)");
      return;
    };
    let responder = self.responders.get(&connection_id).map(|r| r.clone());
    match responder {
      Some(responder) => {
        if responder.tx.send(record).await.is_err() {
          warn!(connection_id, "responder channel closed before delivery");
        }
      }
      None => warn!(connection_id, "dispatcher: unknown connection_id"),
    }
  }
}

/// Mailbox: add(ctx, on_cancel, slot) -> ctx', cancel(slot). Each
/// slot gets its own `CancellationToken`; a Sender operation holding the
/// token races it against its blocking remote call.
#[derive(Clone, Default)]
pub struct Mailbox {
  slots: DashMap<String, CancellationToken>,
}

impl Mailbox {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&self, slot: impl Into<String>) -> CancellationToken {
    let token = CancellationToken::new();
    self.slots.insert(slot.into(), token.clone());
    token
  }

  /// Cancellation and timeouts... If the mailbox is cancelled by
  /// the client (by correlation id), the context is cancelled.
  pub fn cancel(&self, slot: &str) {
    if let Some((_, token)) = self.slots.remove(slot) {
      token.cancel();
    } else {
      warn!(slot, "cancel requested for unknown mailbox slot");
    }
  }

  pub fn forget(&self, slot: &str) {
    self.slots.remove(slot);
  }
}
