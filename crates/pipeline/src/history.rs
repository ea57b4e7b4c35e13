//! `RunHistory`: the per-step metric accumulator, plus the
//! bounded sampled-history buffer backing `GetSampledHistory` (it samples
//! the flushed metrics for later sparkline display).

use std::collections::{BTreeMap, VecDeque};

use runlog_proto::{HistoryRecord, MetricPath, Value};

#[derive(Debug, Clone, Default)]
pub struct RunHistory {
  step: u64,
  client_id: Option<String>,
  values: BTreeMap<MetricPath, Value>,
}

impl RunHistory {
  pub fn new(step: u64) -> Self {
    Self {
      step,
      client_id: None,
      values: BTreeMap::new(),
    }
  }

  pub fn step(&self) -> u64 {
    self.step
  }

  pub fn set_step(&mut self, step: u64) {
    self.step = step;
  }

  pub fn set_client_id(&mut self, client_id: impl Into<String>) {
    self.client_id = Some(client_id.into());
  }

  pub fn set(&mut self, path: MetricPath, value: Value) {
    self.values.insert(path, value);
  }

  pub fn remove(&mut self, path: &MetricPath) {
    self.values.remove(path);
  }

  pub fn get(&self, path: &MetricPath) -> Option<&Value> {
    self.values.get(path)
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn contains(&self, path: &MetricPath) -> bool {
    self.values.contains_key(path)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&MetricPath, &Value)> {
    self.values.iter()
  }

  /// Snapshot into the wire [`HistoryRecord`]; in shared mode `step` is
  /// irrelevant to the backend but still carried for local bookkeeping
  /// (Shared: ignore step numbers... A client id is attached).
  pub fn snapshot_to_record(&self) -> HistoryRecord {
    HistoryRecord {
      step: self.step,
      items: self.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
      client_id: self.client_id.clone(),
    }
  }
}

/// Maximum number of flushed-history points retained for sparkline display,
/// regardless of run length.
pub const SAMPLED_HISTORY_CAP: usize = 100;

/// A bounded, deterministic down-sampler over every flushed `HistoryRecord`
/// (samples the flushed metrics for later sparkline display).
/// Rather than reservoir sampling (which needs a source of randomness this
/// crate otherwise has no use for), this keeps every `stride`-th flush and
/// doubles the stride (halving the buffer) whenever the cap is exceeded —
/// bounded memory with an even spread over the run's full history.
#[derive(Debug, Clone, Default)]
pub struct SampledHistoryBuffer {
  samples: VecDeque<HistoryRecord>,
  stride: usize,
  since_last: usize,
}

impl SampledHistoryBuffer {
  pub fn new() -> Self {
    Self {
      samples: VecDeque::new(),
      stride: 1,
      since_last: 0,
    }
  }

  pub fn record(&mut self, history: &HistoryRecord) {
    if self.since_last + 1 < self.stride {
      self.since_last += 1;
      return;
    }
    self.since_last = 0;
    self.samples.push_back(history.clone());
    if self.samples.len() > SAMPLED_HISTORY_CAP {
      self.thin();
    }
  }

  fn thin(&mut self) {
    self.samples = self.samples.iter().step_by(2).cloned().collect();
    self.stride *= 2;
  }

  pub fn snapshot(&self) -> Vec<HistoryRecord> {
    self.samples.iter().cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshot_round_trips_inserted_values() {
    let mut history = RunHistory::new(3);
    history.set(vec!["loss".into()], Value::Float(0.5));
    assert!(!history.is_empty());
    let record = history.snapshot_to_record();
    assert_eq!(record.step, 3);
    assert_eq!(record.items, vec![(vec!["loss".into()], Value::Float(0.5))]);
    assert!(record.client_id.is_none());
  }

  #[test]
  fn remove_drops_a_key() {
    let mut history = RunHistory::new(0);
    let path = vec!["acc".to_string()];
    history.set(path.clone(), Value::Float(1.0));
    history.remove(&path);
    assert!(history.is_empty());
  }

  fn flushed(step: u64) -> HistoryRecord {
    HistoryRecord {
      step,
      items: vec![(vec!["loss".into()], Value::Float(step as f64))],
      client_id: None,
    }
  }

  #[test]
  fn sampled_history_stays_bounded_across_a_long_run() {
    let mut buffer = SampledHistoryBuffer::new();
    for step in 0..10_000u64 {
      buffer.record(&flushed(step));
    }
    assert!(buffer.snapshot().len() <= SAMPLED_HISTORY_CAP);
  }

  #[test]
  fn sampled_history_keeps_every_point_under_the_cap() {
    let mut buffer = SampledHistoryBuffer::new();
    for step in 0..10u64 {
      buffer.record(&flushed(step));
    }
    assert_eq!(buffer.snapshot().len(), 10);
  }
}
