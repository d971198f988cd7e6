//! Search seeding: one Hyperparameter Draw per rank, written before any
//! worker exists.

use serde::{Deserialize, Serialize};
use sl_store::BufferedPublisher;
use sl_types::{
    fill, validation_error, Category, HyperparameterDraw, HyperparameterSpec, Rank, SlResult,
    HYPERPARAMETERS_FILE,
};
use std::path::Path;
use tracing::info;

/// Seeding document: a canonical specification plus one partial override per worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPlan {
    /// Trials each worker runs.
    pub iterations: usize,
    pub canonical: HyperparameterSpec,
    #[serde(default)]
    pub workers: Vec<HyperparameterSpec>,
}

impl SearchPlan {
    pub fn new(iterations: usize, canonical: HyperparameterSpec) -> Self {
        Self {
            iterations,
            canonical,
            workers: Vec::new(),
        }
    }

    pub fn with_worker(mut self, partial: HyperparameterSpec) -> Self {
        self.workers.push(partial);
        self
    }

    pub fn load(path: &Path) -> SlResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The initial draw of `rank`: the canonical spec filled with the rank's overrides.
    pub fn draw_for(&self, rank: Rank) -> Option<HyperparameterDraw> {
        self.workers
            .get(rank)
            .map(|partial| HyperparameterDraw::new(fill(&self.canonical, partial), self.iterations))
    }

    pub fn validate(&self) -> SlResult<()> {
        if self.workers.is_empty() {
            return Err(validation_error!("search plan has no workers"));
        }
        self.canonical.validate()?;
        for rank in 0..self.workers.len() {
            if let Some(draw) = self.draw_for(rank) {
                draw.validate()
                    .map_err(|e| validation_error!("worker {}: {}", rank, e))?;
            }
        }
        Ok(())
    }
}

/// Reset the search: clear all worker progress and shared errors, then write
/// the initial draw for every rank. Returns the draws written, by rank.
pub async fn seed_search(
    publisher: &BufferedPublisher,
    plan: &SearchPlan,
) -> SlResult<Vec<HyperparameterDraw>> {
    plan.validate()?;

    publisher.delete_prefix(&Category::VmProgress.prefix()).await?;
    publisher.delete_prefix(&Category::SharedErrors.prefix()).await?;

    let mut draws = Vec::with_capacity(plan.worker_count());
    for rank in 0..plan.worker_count() {
        if let Some(draw) = plan.draw_for(rank) {
            publisher
                .publish_json(
                    HYPERPARAMETERS_FILE,
                    &draw,
                    &Category::VmProgress.rank_prefix(rank),
                )
                .await?;
            draws.push(draw);
        }
    }

    info!(
        workers = draws.len(),
        iterations = plan.iterations,
        "seeded hyperparameter search"
    );
    Ok(draws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sl_store::MemoryBlobStore;
    use sl_types::{ParameterSpec, SlError};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn plan() -> SearchPlan {
        let canonical = HyperparameterSpec::new()
            .add_range("learning_rate", 0.0001, 0.01)
            .add_fixed("batch_size", 64_i64);
        SearchPlan::new(3, canonical)
            .with_worker(HyperparameterSpec::new())
            .with_worker(HyperparameterSpec::new().add_fixed("batch_size", 128_i64))
    }

    #[test]
    fn draws_fill_the_canonical_spec() {
        let plan = plan();
        let draw = plan.draw_for(1).unwrap();
        assert_eq!(draw.spec().len(), 2);
        assert_eq!(draw.spec().get("batch_size"), Some(&ParameterSpec::fixed(128_i64)));
        assert_eq!(
            draw.spec().get("learning_rate"),
            Some(&ParameterSpec::range(0.0001, 0.01))
        );
        assert_eq!(draw.current_iter(), 0);
        assert_eq!(draw.max_iter(), 3);
        assert!(draw.current_values().is_none());
        assert!(plan.draw_for(2).is_none());
    }

    #[test]
    fn plan_document_parses() {
        let doc = json!({
            "iterations": 5,
            "canonical": {"lr": [0.001, 0.1], "epochs": 10},
            "workers": [{}, {"lr": [0.01, 0.02]}]
        });
        let plan: SearchPlan = serde_json::from_value(doc).unwrap();
        assert_eq!(plan.worker_count(), 2);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn invalid_override_is_rejected() {
        let plan = plan().with_worker(HyperparameterSpec::new().add_range("learning_rate", 1.0, 0.5));
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, SlError::Validation(_)));
        assert!(err.to_string().contains("worker 2"));
    }

    #[tokio::test]
    async fn seeding_resets_progress_and_errors() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let publisher = BufferedPublisher::new(dir.path(), store.clone()).unwrap();

        publisher.publish("progress.json", b"{}", "vm-progress/7/trial").await.unwrap();
        publisher.publish("old.json", b"{}", "shared-errors").await.unwrap();
        publisher.publish("progress.json", b"{}", "best-models/0").await.unwrap();

        let draws = seed_search(&publisher, &plan()).await.unwrap();
        assert_eq!(draws.len(), 2);

        assert_eq!(
            store.keys(""),
            vec![
                "best-models/0/progress.json",
                "vm-progress/0/hyperparameters.json",
                "vm-progress/1/hyperparameters.json",
            ]
        );

        let stored: HyperparameterDraw = publisher
            .fetch_json("vm-progress/1", HYPERPARAMETERS_FILE)
            .await
            .unwrap();
        assert_eq!(stored, draws[1]);
    }
}
