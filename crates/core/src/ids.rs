use std::fmt;

/// Identifies a single run within the service process.
///
/// Distinct from the backend's `(entity, project, run-id)` triple (owned by
/// `StreamRun` once the run upsert completes); this is the local key used to
/// address a `Stream` before or after the remote identity is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(String);

impl RunId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RunId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<String> for RunId {
  fn from(value: String) -> Self {
    Self(value)
  }
}

impl From<&str> for RunId {
  fn from(value: &str) -> Self {
    Self(value.to_string())
  }
}

/// A monotonically increasing sequence number assigned by the Writer.
///
/// Records with `control.local = true` are never numbered; every other
/// persisted record gets a strictly increasing `RecordNumber` matching the
/// order it was appended to the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordNumber(pub u64);

impl RecordNumber {
  pub const ZERO: RecordNumber = RecordNumber(0);

  pub fn next(self) -> Self {
    RecordNumber(self.0 + 1)
  }
}

impl fmt::Display for RecordNumber {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}
