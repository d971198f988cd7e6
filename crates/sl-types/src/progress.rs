//! Per-trial progress records and best-result comparison.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether the comparison metric is maximized or minimized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    #[default]
    Max,
    Min,
}

impl Goal {
    /// Extreme of `values` under this goal, ignoring non-finite entries.
    pub fn extreme(&self, values: &[f64]) -> Option<f64> {
        let finite = values.iter().copied().filter(|v| v.is_finite());
        match self {
            Goal::Max => finite.reduce(f64::max),
            Goal::Min => finite.reduce(f64::min),
        }
    }

    /// Strict improvement; ties are not improvements.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Goal::Max => candidate > incumbent,
            Goal::Min => candidate < incumbent,
        }
    }
}

/// Default comparison metric of a fresh record.
pub const DEFAULT_COMPARE_METRIC: &str = "val_accuracy";

/// Explicit epoch counter series; when present it drives resumption.
pub const EPOCHS_SERIES: &str = "epochs";

/// History of every metric a trial reported, plus the metric and goal used to
/// rank trials against each other.
///
/// Serialized flat: `{"compare": ..., "goal": ..., "<metric>": [values...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    compare: String,
    goal: Goal,
    #[serde(flatten)]
    metrics: BTreeMap<String, Vec<f64>>,
}

impl Default for ProgressRecord {
    fn default() -> Self {
        Self {
            compare: DEFAULT_COMPARE_METRIC.to_string(),
            goal: Goal::Max,
            metrics: BTreeMap::new(),
        }
    }
}

impl ProgressRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compare_goal(mut self, compare: impl Into<String>, goal: Goal) -> Self {
        self.set_compare_goal(compare, goal);
        self
    }

    pub fn set_compare_goal(&mut self, compare: impl Into<String>, goal: Goal) {
        self.compare = compare.into();
        self.goal = goal;
    }

    pub fn compare(&self) -> &str {
        &self.compare
    }

    pub fn goal(&self) -> Goal {
        self.goal
    }

    /// Append one observation to the `key` series.
    pub fn record(&mut self, key: impl Into<String>, value: f64) {
        self.metrics.entry(key.into()).or_default().push(value);
    }

    /// Builder form of [`ProgressRecord::record`].
    pub fn with_value(mut self, key: impl Into<String>, value: f64) -> Self {
        self.record(key, value);
        self
    }

    pub fn series(&self, key: &str) -> Option<&[f64]> {
        self.metrics.get(key).map(Vec::as_slice)
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    pub fn compare_values(&self) -> &[f64] {
        self.series(&self.compare).unwrap_or(&[])
    }

    /// Extreme recorded value of the comparison metric.
    pub fn best(&self) -> Option<f64> {
        self.goal.extreme(self.compare_values())
    }

    /// Would `value` strictly beat everything recorded so far?
    pub fn improves_on(&self, value: f64) -> bool {
        match self.best() {
            Some(best) => self.goal.improves(value, best),
            None => value.is_finite(),
        }
    }

    /// Index of the next epoch to run when resuming this record.
    pub fn next_epoch(&self) -> usize {
        if let Some(last) = self.series(EPOCHS_SERIES).and_then(|s| s.last()) {
            if last.is_finite() && *last >= 0.0 {
                return *last as usize + 1;
            }
        }
        self.metrics.values().next().map_or(0, Vec::len)
    }

    /// An empty record that keeps this record's comparison metric and goal.
    pub fn fresh(&self) -> Self {
        Self {
            compare: self.compare.clone(),
            goal: self.goal,
            metrics: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Should `candidate` replace `incumbent` in a best-result slot?
///
/// No incumbent means the candidate wins. A candidate without values for its
/// comparison metric never wins; an incumbent without values loses to any
/// candidate that has them. Otherwise the candidate must strictly improve on
/// the incumbent's extreme value.
pub fn is_better(candidate: &ProgressRecord, incumbent: Option<&ProgressRecord>) -> bool {
    let Some(incumbent) = incumbent else {
        return true;
    };
    let goal = candidate.goal;
    let Some(candidate_best) = goal.extreme(candidate.compare_values()) else {
        return false;
    };
    let incumbent_values = incumbent.series(&candidate.compare).unwrap_or(&[]);
    match goal.extreme(incumbent_values) {
        Some(incumbent_best) => goal.improves(candidate_best, incumbent_best),
        None => true,
    }
}
