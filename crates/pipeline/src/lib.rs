//! The per-run ingestion pipeline: Handler → Writer → FlowControl → Sender,
//! connected by bounded channels, with an append-only transaction log for
//! durability/replay.
//!
//! Module map:
//! - [`work`]: the `Work`/`MaybeSavedWork` pipeline units.
//! - [`history`] / [`summary`]: `RunHistory`, `RunSummary`, `MetricHandler`.
//! - [`parser`]: `RecordParser`.
//! - [`handler`]: the Handler stage.
//! - [`writer`] / [`log`]: the Writer stage and transaction-log framing.
//! - [`flow_control`]: the FlowControl buffer.
//! - [`sender`]: the Sender stage, run upsert, and finish sequence.
//! - [`dispatcher`]: result fan-in and the Mailbox.
//! - [`reader`]: sync-mode transaction-log replay.
//! - [`stream`]: `Stream` lifecycle wiring all of the above per mode.
//! - [`collab`]: collaborator trait boundary and an in-process fake.

pub mod collab;
pub mod dispatcher;
pub mod flow_control;
pub mod handler;
pub mod hang;
pub mod history;
pub mod log;
pub mod parser;
pub mod reader;
pub mod sender;
pub mod stream;
pub mod summary;
pub mod work;

/// Channel buffer depth for every pipeline stage boundary. The
/// store-write queue internal to the Writer uses `8 * BUFFER_SIZE`.
pub const BUFFER_SIZE: usize = 32;
