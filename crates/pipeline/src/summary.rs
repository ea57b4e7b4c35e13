//! `RunSummary` and `MetricHandler` (RunSummary, "MetricDefinition").

use std::collections::{BTreeMap, BTreeSet};

use runlog_proto::{HistoryRecord, MetricAggregation, MetricDefinition, MetricPath, SummaryItem, SummaryOp, SummaryRecord, Value};

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
  values: BTreeMap<MetricPath, Value>,
  /// Running (sum, count) for every path with a `Mean` aggregation applied,
  /// so repeated flushes can maintain a true mean rather than an EMA.
  means: BTreeMap<MetricPath, (f64, u64)>,
}

fn aggregated_path(base: &MetricPath, suffix: &str) -> MetricPath {
  let mut path = base.clone();
  let head = path.pop().unwrap_or_default();
  path.push(format!("{head}.{suffix}"));
  path
}

fn definition_matches(def_name: &str, path: &MetricPath) -> bool {
  let joined = path.join(".");
  match def_name.strip_suffix('*') {
    Some(prefix) => joined.starts_with(prefix),
    None => joined == def_name,
  }
}

impl RunSummary {
  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn get(&self, path: &MetricPath) -> Option<&Value> {
    self.values.get(path)
  }

  /// Summary: apply update/remove to the authoritative summary.
  pub fn apply_item(&mut self, item: &SummaryItem) {
    match &item.op {
      SummaryOp::Update(value) => {
        self.values.insert(item.path.clone(), value.clone());
      }
      SummaryOp::Remove => {
        self.values.remove(&item.path);
      }
    }
  }

  /// updates the authoritative summary derived from definitions
  /// — applied once per flushed history event, using whichever
  /// `MetricDefinition`s (by exact name or glob prefix) match each item.
  pub fn apply_history(&mut self, history: &HistoryRecord, definitions: &[MetricDefinition]) {
    for (path, value) in &history.items {
      self.values.insert(path.clone(), value.clone());
      for def in definitions {
        if definition_matches(&def.name, path) {
          for aggregation in &def.aggregations {
            self.apply_aggregation(path, value, *aggregation);
          }
        }
      }
    }
  }

  fn apply_aggregation(&mut self, path: &MetricPath, value: &Value, aggregation: MetricAggregation) {
    let Some(numeric) = value.as_f64() else { return };
    match aggregation {
      MetricAggregation::Last => {
        self.values.insert(aggregated_path(path, "last"), value.clone());
      }
      MetricAggregation::Min => {
        let target = aggregated_path(path, "min");
        let replace = self.values.get(&target).and_then(Value::as_f64).is_none_or(|existing| numeric < existing);
        if replace {
          self.values.insert(target, value.clone());
        }
      }
      MetricAggregation::Max => {
        let target = aggregated_path(path, "max");
        let replace = self.values.get(&target).and_then(Value::as_f64).is_none_or(|existing| numeric > existing);
        if replace {
          self.values.insert(target, value.clone());
        }
      }
      MetricAggregation::Mean => {
        let entry = self.means.entry(path.clone()).or_insert((0.0, 0));
        entry.0 += numeric;
        entry.1 += 1;
        let mean = entry.0 / entry.1 as f64;
        self.values.insert(aggregated_path(path, "mean"), Value::Float(mean));
      }
    }
  }

  /// `_wandb.runtime` must never regress.
  pub fn runtime_seconds(&self) -> Option<f64> {
    self.values.get(&runtime_path()).and_then(Value::as_f64)
  }

  pub fn set_runtime_seconds(&mut self, seconds: f64) {
    self.values.insert(runtime_path(), Value::Float(seconds));
  }

  pub fn to_record(&self) -> SummaryRecord {
    SummaryRecord {
      items: self
        .values
        .iter()
        .map(|(path, value)| SummaryItem {
          path: path.clone(),
          op: SummaryOp::Update(value.clone()),
        })
        .collect(),
    }
  }

  /// Flattened JSON form, used for the `wandb-summary.json` upload.
  pub fn to_json(&self) -> serde_json::Value {
    let flat: BTreeMap<String, Value> = self.values.iter().map(|(k, v)| (k.join("."), v.clone())).collect();
    serde_json::to_value(flat).unwrap_or(serde_json::Value::Null)
  }
}

fn runtime_path() -> MetricPath {
  vec!["_wandb".into(), "runtime".into()]
}

/// Owns the set of registered `MetricDefinition`s and tracks which concrete
/// glob expansions have already been emitted (MetricHandler).
#[derive(Debug, Clone, Default)]
pub struct MetricHandler {
  definitions: Vec<MetricDefinition>,
  expanded: BTreeSet<String>,
  /// Last value seen at each step-metric path, so a later flush that omits
  /// the x-axis value (only sending the y-metric) can still cross-reference
  /// it (inserts step-metric cross-references).
  last_step_metric_values: BTreeMap<MetricPath, Value>,
}

impl MetricHandler {
  pub fn definitions(&self) -> &[MetricDefinition] {
    &self.definitions
  }

  /// register definition in MetricHandler and, if the definition
  /// pins a single name, eagerly update the corresponding summary field.
  /// Returns the definition back to the caller when it is eager (non-glob)
  /// so the Handler can apply it immediately against the current summary.
  pub fn register(&mut self, definition: MetricDefinition) -> Option<MetricDefinition> {
    let eager = (!definition.expand_glob).then(|| definition.clone());
    self.definitions.push(definition);
    eager
  }

  /// expands any glob metric definitions... when a glob
  /// definition matches a new concrete metric. Returns freshly-pinned
  /// definitions for metric paths seen for the first time in `history`.
  pub fn expand_for_history(&mut self, history: &HistoryRecord) -> Vec<MetricDefinition> {
    let mut emitted = Vec::new();
    for (path, _) in &history.items {
      let joined = path.join(".");
      if self.expanded.contains(&joined) {
        continue;
      }
      if let Some(def) = self.definitions.iter().find(|d| d.expand_glob && definition_matches(&d.name, path)) {
        self.expanded.insert(joined.clone());
        emitted.push(MetricDefinition {
          name: joined,
          step_metric: def.step_metric.clone(),
          aggregations: def.aggregations.clone(),
          expand_glob: false,
        });
      }
    }
    emitted
  }

  /// inserts step-metric cross-references: remembers the last
  /// value seen at each definition's `step_metric` path, and for a flush
  /// that carries the y-metric but not the x-metric, returns the cached
  /// x-value so it rides along unchanged.
  pub fn step_metric_crossrefs(&mut self, history: &HistoryRecord) -> Vec<(MetricPath, Value)> {
    let mut out = Vec::new();
    for def in &self.definitions {
      let Some(step_metric) = &def.step_metric else { continue };
      let step_path: MetricPath = step_metric.split('.').map(str::to_string).collect();

      if let Some((_, v)) = history.items.iter().find(|(p, _)| *p == step_path) {
        self.last_step_metric_values.insert(step_path.clone(), v.clone());
        continue;
      }

      let has_y = history.items.iter().any(|(p, _)| definition_matches(&def.name, p));
      if has_y && let Some(cached) = self.last_step_metric_values.get(&step_path) {
        out.push((step_path, cached.clone()));
      }
    }
    out
  }
}
