use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-record control metadata.
///
/// Carried alongside every [`crate::Record`] but kept as a separate struct
/// (rather than flattened fields) because most stages only read one or two
/// of these regardless of which `Record` variant they're attached to.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Control {
  /// Forces forwarding past the offline gate even when `settings.offline` is set.
  #[serde(default)]
  pub always_send: bool,
  /// The Writer skips the log for this record entirely; it is never numbered.
  #[serde(default)]
  pub local: bool,
  /// Reply target: correlates a response back to a client-chosen mailbox.
  pub mailbox_slot: Option<String>,
  /// Dispatcher routing key: which connection this record's result belongs to.
  pub connection_id: Option<String>,
  /// The client is awaiting a response even without a `mailbox_slot`.
  #[serde(default)]
  pub req_resp: bool,
  /// Opaque client-chosen identifier, echoed back for idempotency/tracing.
  pub uuid: Option<Uuid>,
}

impl Control {
  pub fn with_mailbox_slot(mut self, slot: impl Into<String>) -> Self {
    self.mailbox_slot = Some(slot.into());
    self
  }

  pub fn with_connection_id(mut self, id: impl Into<String>) -> Self {
    self.connection_id = Some(id.into());
    self
  }

  pub fn expects_reply(&self) -> bool {
    self.req_resp || self.mailbox_slot.is_some()
  }
}
