use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A metric path is a sequence of key segments, e.g. `["train", "loss"]` for
/// a nested key `train.loss`.
pub type MetricPath = Vec<String>;

/// The value shape shared by [`crate::HistoryRecord`] and
/// [`crate::SummaryRecord`] entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  Bytes(Vec<u8>),
  Map(BTreeMap<String, Value>),
  List(Vec<Value>),
}

impl Value {
  /// Best-effort numeric coercion, used by summary aggregation (min/max/mean).
  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Value::Int(i) => Some(*i as f64),
      Value::Float(f) => Some(*f),
      Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
      _ => None,
    }
  }
}

impl From<bool> for Value {
  fn from(v: bool) -> Self {
    Value::Bool(v)
  }
}

impl From<i64> for Value {
  fn from(v: i64) -> Self {
    Value::Int(v)
  }
}

impl From<f64> for Value {
  fn from(v: f64) -> Self {
    Value::Float(v)
  }
}

impl From<String> for Value {
  fn from(v: String) -> Self {
    Value::Str(v)
  }
}

impl From<&str> for Value {
  fn from(v: &str) -> Self {
    Value::Str(v.to_string())
  }
}
