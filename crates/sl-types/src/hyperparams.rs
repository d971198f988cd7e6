//! Hyperparameter search space specification and per-worker draws.

use rand::distr::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{SlResult, StateError};
use crate::validation_error;

/// A concrete parameter value, either sampled from a range or copied from a
/// fixed entry of the specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Json(v) => v.as_f64(),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Json(serde_json::Value::String(v.to_string()))
    }
}

/// One entry of the specification. Ranges are written as `[low, high)`
/// two-element arrays; anything else is a fixed value passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterSpec {
    Range([f64; 2]),
    Fixed(ParameterValue),
}

impl ParameterSpec {
    pub fn range(low: f64, high: f64) -> Self {
        Self::Range([low, high])
    }

    pub fn fixed(value: impl Into<ParameterValue>) -> Self {
        Self::Fixed(value.into())
    }

    /// `(low, high)` for ranged entries.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        match self {
            Self::Range([low, high]) => Some((*low, *high)),
            Self::Fixed(_) => None,
        }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match self {
            Self::Range([low, high]) => match Uniform::new(*low, *high) {
                Ok(uniform) => {
                    let value = uniform.sample(rng);
                    // Rounding can land on the excluded upper bound.
                    ParameterValue::Float(if value < *high { value } else { *low })
                }
                // Unvalidated ranges collapse to their lower bound.
                Err(_) => ParameterValue::Float(*low),
            },
            Self::Fixed(value) => value.clone(),
        }
    }
}

/// A concrete assignment for every key of a specification.
pub type Assignment = BTreeMap<String, ParameterValue>;

/// Mapping from parameter name to a fixed value or a sampling range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HyperparameterSpec {
    entries: BTreeMap<String, ParameterSpec>,
}

impl HyperparameterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_range(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.entries.insert(name.into(), ParameterSpec::range(low, high));
        self
    }

    pub fn add_fixed(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.entries.insert(name.into(), ParameterSpec::fixed(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.entries.get(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every range must have finite bounds with `low < high` and a finite width.
    pub fn validate(&self) -> SlResult<()> {
        for (name, entry) in &self.entries {
            if let Some((low, high)) = entry.bounds() {
                if !low.is_finite() || !high.is_finite() || low >= high || !(high - low).is_finite()
                {
                    return Err(validation_error!(
                        "parameter '{}' has an empty or non-finite range [{}, {})",
                        name,
                        low,
                        high
                    ));
                }
            }
        }
        Ok(())
    }

    /// Draw one value per key: uniform over ranges, verbatim for fixed entries.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Assignment {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.sample(rng)))
            .collect()
    }

    /// See [`fill`].
    pub fn fill(&self, partial: &HyperparameterSpec) -> HyperparameterSpec {
        fill(self, partial)
    }
}

impl FromIterator<(String, ParameterSpec)> for HyperparameterSpec {
    fn from_iter<T: IntoIterator<Item = (String, ParameterSpec)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Derive a worker's effective specification from the canonical one.
///
/// The result has exactly the canonical key set: keys present in `partial`
/// take its value, the rest keep the canonical value, and keys that only
/// exist in `partial` are dropped.
pub fn fill(canonical: &HyperparameterSpec, partial: &HyperparameterSpec) -> HyperparameterSpec {
    canonical
        .entries
        .iter()
        .map(|(name, entry)| {
            let chosen = partial.entries.get(name).unwrap_or(entry);
            (name.clone(), chosen.clone())
        })
        .collect()
}

/// The persisted per-worker draw document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterDraw {
    hyperparameters: HyperparameterSpec,
    #[serde(default)]
    current_values: Option<Assignment>,
    current_iter: usize,
    max_iter: usize,
    /// Set when the values were recovered from persisted state rather than sampled.
    #[serde(skip)]
    resumed: bool,
}

impl HyperparameterDraw {
    pub fn new(hyperparameters: HyperparameterSpec, max_iter: usize) -> Self {
        Self {
            hyperparameters,
            current_values: None,
            current_iter: 0,
            max_iter,
            resumed: false,
        }
    }

    /// Parse and validate a persisted draw document. Any problem is reported
    /// as malformed state for `path`.
    pub fn from_slice(bytes: &[u8], path: &str) -> SlResult<Self> {
        let draw: Self = serde_json::from_slice(bytes).map_err(|e| StateError::Malformed {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        draw.validate().map_err(|e| StateError::Malformed {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Ok(draw)
    }

    pub fn validate(&self) -> SlResult<()> {
        self.hyperparameters.validate()?;
        if self.current_iter > self.max_iter {
            return Err(validation_error!(
                "current_iter {} exceeds max_iter {}",
                self.current_iter,
                self.max_iter
            ));
        }
        if let Some(values) = &self.current_values {
            if let Some(missing) = self.hyperparameters.keys().find(|k| !values.contains_key(*k)) {
                return Err(validation_error!("current_values has no entry for '{}'", missing));
            }
        }
        Ok(())
    }

    pub fn spec(&self) -> &HyperparameterSpec {
        &self.hyperparameters
    }

    pub fn current_values(&self) -> Option<&Assignment> {
        self.current_values.as_ref()
    }

    pub fn current_iter(&self) -> usize {
        self.current_iter
    }

    pub fn max_iter(&self) -> usize {
        self.max_iter
    }

    pub fn is_complete(&self) -> bool {
        self.current_iter == self.max_iter
    }

    /// True only when values were recovered from persisted state, i.e. a trial
    /// was interrupted and its checkpoint should be handed back to it.
    pub fn should_load_checkpoint(&self) -> bool {
        self.resumed
    }

    /// Ready a freshly loaded draw for its next trial: persisted values mean
    /// a resumed trial, otherwise new values are sampled.
    pub fn prepare<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        if self.current_values.is_some() {
            self.resumed = true;
        } else {
            self.sample(rng);
        }
    }

    /// Sample a new assignment; the next trial starts from scratch.
    pub fn sample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> &Assignment {
        self.resumed = false;
        self.current_values.insert(self.hyperparameters.sample(rng))
    }

    /// Move to the next iteration with a fresh assignment.
    pub fn advance<R: Rng + ?Sized>(&mut self, rng: &mut R) -> SlResult<()> {
        if self.is_complete() {
            return Err(StateError::IterationOverflow {
                current_iter: self.current_iter,
                max_iter: self.max_iter,
            }
            .into());
        }
        self.current_iter += 1;
        self.sample(rng);
        Ok(())
    }

    /// Same specification and counters with no sampled values.
    pub fn cleared(&self) -> Self {
        Self {
            hyperparameters: self.hyperparameters.clone(),
            current_values: None,
            current_iter: self.current_iter,
            max_iter: self.max_iter,
            resumed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn sample_spec() -> HyperparameterSpec {
        HyperparameterSpec::new()
            .add_range("lr", 0.0001, 0.1)
            .add_range("momentum", 0.5, 0.99)
            .add_fixed("batch_size", 64_i64)
            .add_fixed("optimizer", "sgd")
    }

    #[test]
    fn fill_keeps_canonical_keys() {
        let canonical: HyperparameterSpec =
            serde_json::from_value(json!({"a": [0, 1], "b": 5})).unwrap();
        let partial: HyperparameterSpec = serde_json::from_value(json!({"a": [0, 1]})).unwrap();

        let filled = fill(&canonical, &partial);
        assert_eq!(filled, canonical);
        assert_eq!(serde_json::to_value(&filled).unwrap(), json!({"a": [0.0, 1.0], "b": 5}));
    }

    #[test]
    fn fill_overrides_and_ignores_unknown_keys() {
        let canonical = sample_spec();
        let partial = HyperparameterSpec::new()
            .add_range("lr", 0.2, 0.3)
            .add_fixed("dropout", 0.5);

        let filled = canonical.fill(&partial);
        assert_eq!(filled.len(), canonical.len());
        assert_eq!(filled.get("lr"), Some(&ParameterSpec::range(0.2, 0.3)));
        assert_eq!(filled.get("batch_size"), canonical.get("batch_size"));
        assert!(filled.get("dropout").is_none());
    }

    #[test]
    fn sample_respects_half_open_bounds() {
        let spec = sample_spec();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..500 {
            let values = spec.sample(&mut rng);
            let lr = values["lr"].as_f64().unwrap();
            assert!((0.0001..0.1).contains(&lr), "lr out of bounds: {lr}");
            let momentum = values["momentum"].as_f64().unwrap();
            assert!((0.5..0.99).contains(&momentum));
            assert_eq!(values["batch_size"], ParameterValue::Int(64));
            assert_eq!(values["optimizer"], ParameterValue::from("sgd"));
        }
    }

    #[test]
    fn validate_rejects_empty_range() {
        let spec = HyperparameterSpec::new().add_range("lr", 0.5, 0.5);
        assert!(spec.validate().is_err());
        let spec = HyperparameterSpec::new().add_range("lr", 1.0, 0.0);
        assert!(spec.validate().is_err());
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn range_wider_than_f64_is_rejected() {
        let spec = HyperparameterSpec::new().add_range("x", -1e308, 1e308);
        assert!(spec.validate().is_err());

        let doc = json!({
            "hyperparameters": {"x": [-1e308, 1e308]},
            "current_iter": 0,
            "max_iter": 1
        });
        let err = HyperparameterDraw::from_slice(&serde_json::to_vec(&doc).unwrap(), "p")
            .unwrap_err();
        assert!(matches!(err, crate::SlError::State(StateError::Malformed { .. })));

        // Sampling without validation still yields a value.
        let values = spec.sample(&mut StdRng::seed_from_u64(3));
        assert_eq!(values["x"], ParameterValue::Float(-1e308));
    }

    #[test]
    fn advance_increments_by_one_until_complete() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut draw = HyperparameterDraw::new(sample_spec(), 3);
        draw.prepare(&mut rng);
        assert!(!draw.should_load_checkpoint());

        for expected in 1..=3 {
            draw.advance(&mut rng).unwrap();
            assert_eq!(draw.current_iter(), expected);
            assert_eq!(draw.max_iter(), 3);
            assert!(draw.current_values().is_some());
            assert!(!draw.should_load_checkpoint());
        }
        assert!(draw.is_complete());

        let err = draw.advance(&mut rng).unwrap_err();
        assert!(matches!(
            err,
            crate::SlError::State(StateError::IterationOverflow { .. })
        ));
        assert_eq!(draw.current_iter(), 3);
    }

    #[test]
    fn persisted_values_mark_resumed() {
        let doc = json!({
            "hyperparameters": {"lr": [0.0, 1.0], "epochs": 10},
            "current_values": {"lr": 0.25, "epochs": 10},
            "current_iter": 1,
            "max_iter": 4
        });
        let bytes = serde_json::to_vec(&doc).unwrap();
        let mut draw = HyperparameterDraw::from_slice(&bytes, "vm-progress/0/hyperparameters.json")
            .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        draw.prepare(&mut rng);

        assert!(draw.should_load_checkpoint());
        assert_eq!(draw.current_values().unwrap()["lr"], ParameterValue::Float(0.25));
    }

    #[test]
    fn missing_current_values_is_null() {
        let doc = json!({
            "hyperparameters": {"lr": [0.0, 1.0]},
            "current_iter": 0,
            "max_iter": 2
        });
        let bytes = serde_json::to_vec(&doc).unwrap();
        let mut draw = HyperparameterDraw::from_slice(&bytes, "p").unwrap();
        assert!(draw.current_values().is_none());

        draw.prepare(&mut StdRng::seed_from_u64(5));
        assert!(!draw.should_load_checkpoint());
        assert!(draw.current_values().is_some());

        let cleared = draw.cleared();
        let value = serde_json::to_value(&cleared).unwrap();
        assert_eq!(value["current_values"], serde_json::Value::Null);
        assert_eq!(value["max_iter"], 2);
    }

    #[test]
    fn malformed_documents_are_rejected() {
        let over = json!({"hyperparameters": {}, "current_iter": 3, "max_iter": 2});
        let err = HyperparameterDraw::from_slice(&serde_json::to_vec(&over).unwrap(), "p")
            .unwrap_err();
        assert!(matches!(err, crate::SlError::State(StateError::Malformed { .. })));

        let err = HyperparameterDraw::from_slice(b"{not json", "p").unwrap_err();
        assert!(matches!(err, crate::SlError::State(StateError::Malformed { .. })));

        let partial_values = json!({
            "hyperparameters": {"lr": [0.0, 1.0], "wd": [0.0, 0.1]},
            "current_values": {"lr": 0.3},
            "current_iter": 0,
            "max_iter": 2
        });
        assert!(
            HyperparameterDraw::from_slice(&serde_json::to_vec(&partial_values).unwrap(), "p")
                .is_err()
        );
    }
}
