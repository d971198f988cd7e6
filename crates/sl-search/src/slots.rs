//! Per-rank persisted state: the working slot under `vm-progress/{rank}` and
//! the best-result slot under `best-models/{rank}`.
//!
//! Both slots hold the same triple of files: the draw, the progress record
//! and (optionally) the trial checkpoint. In the working slot the progress
//! and checkpoint live under `vm-progress/{rank}/trial` so a finished trial
//! can be cleared without removing the draw.

use chrono::{DateTime, Utc};
use sl_store::BufferedPublisher;
use sl_types::{
    final_results_name, is_better, object_path, trial_error_name, trial_results_name, Category,
    HyperparameterDraw, ProgressRecord, Rank, ResultsRecord, SlResult, StateError,
    TrialErrorReport, CHECKPOINT_FILE, HYPERPARAMETERS_FILE, PROGRESS_FILE, TRIAL_DIR,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Storage handle scoped to one rank.
#[derive(Debug, Clone)]
pub struct RankSlots {
    rank: Rank,
    publisher: Arc<BufferedPublisher>,
}

impl RankSlots {
    pub fn new(rank: Rank, publisher: Arc<BufferedPublisher>) -> Self {
        Self { rank, publisher }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn publisher(&self) -> &BufferedPublisher {
        &self.publisher
    }

    pub fn working_prefix(&self) -> String {
        Category::VmProgress.rank_prefix(self.rank)
    }

    /// Progress and checkpoint of the trial in flight.
    pub fn trial_prefix(&self) -> String {
        object_path(&self.working_prefix(), TRIAL_DIR)
    }

    pub fn best_prefix(&self) -> String {
        Category::BestModels.rank_prefix(self.rank)
    }

    pub fn results_prefix(&self) -> String {
        Category::Results.rank_prefix(self.rank)
    }

    // -- working slot -------------------------------------------------------

    /// The persisted draw. Missing or malformed is fatal for the worker.
    pub async fn load_draw(&self) -> SlResult<HyperparameterDraw> {
        let prefix = self.working_prefix();
        let path = object_path(&prefix, HYPERPARAMETERS_FILE);
        match self.publisher.fetch_optional(&prefix, HYPERPARAMETERS_FILE).await? {
            Some(bytes) => HyperparameterDraw::from_slice(&bytes, &path),
            None => Err(StateError::Missing { path }.into()),
        }
    }

    pub async fn load_progress(&self) -> SlResult<Option<ProgressRecord>> {
        self.publisher
            .fetch_optional_json(&self.trial_prefix(), PROGRESS_FILE)
            .await
    }

    /// Download the working checkpoint to scratch space, if there is one.
    pub async fn load_checkpoint(&self) -> SlResult<Option<PathBuf>> {
        let Some(bytes) = self.checkpoint_bytes().await? else {
            return Ok(None);
        };
        let local = self
            .publisher
            .scratch_dir()
            .join(format!("resume-{}", CHECKPOINT_FILE));
        tokio::fs::write(&local, &bytes).await?;
        debug!(rank = self.rank, path = %local.display(), "downloaded working checkpoint");
        Ok(Some(local))
    }

    pub async fn checkpoint_bytes(&self) -> SlResult<Option<Vec<u8>>> {
        self.publisher
            .fetch_optional(&self.trial_prefix(), CHECKPOINT_FILE)
            .await
    }

    pub async fn save_draw(&self, draw: &HyperparameterDraw) -> SlResult<()> {
        self.publisher
            .publish_json(HYPERPARAMETERS_FILE, draw, &self.working_prefix())
            .await
    }

    /// Persist the progress record of the trial in flight.
    pub async fn save_progress(&self, progress: &ProgressRecord) -> SlResult<()> {
        self.publisher
            .publish_json(PROGRESS_FILE, progress, &self.trial_prefix())
            .await
    }

    /// Persist the checkpoint (when given) and progress of the trial in
    /// flight, then the draw.
    pub async fn save_working(
        &self,
        checkpoint: Option<&[u8]>,
        progress: &ProgressRecord,
        draw: &HyperparameterDraw,
    ) -> SlResult<()> {
        if let Some(bytes) = checkpoint {
            self.publisher
                .publish(CHECKPOINT_FILE, bytes, &self.trial_prefix())
                .await?;
        }
        self.save_progress(progress).await?;
        self.save_draw(draw).await
    }

    /// Drop the progress and checkpoint of the finished trial. The draw is kept.
    pub async fn clear_trial(&self) -> SlResult<()> {
        self.publisher.delete_prefix(&self.trial_prefix()).await
    }

    // -- best slot ----------------------------------------------------------

    /// Progress record of the best result so far. An empty slot is `None`;
    /// an unreadable or unparsable one is an error.
    pub async fn load_best(&self) -> SlResult<Option<ProgressRecord>> {
        self.publisher
            .fetch_optional_json(&self.best_prefix(), PROGRESS_FILE)
            .await
    }

    /// Overwrite the best slot when `progress` beats it. Returns whether the
    /// slot was replaced. Without a checkpoint the previous slot contents are
    /// dropped first so a stale checkpoint is never paired with new progress.
    pub async fn update_best(
        &self,
        progress: &ProgressRecord,
        draw: &HyperparameterDraw,
        checkpoint: Option<&[u8]>,
    ) -> SlResult<bool> {
        let incumbent = self.load_best().await?;
        if !is_better(progress, incumbent.as_ref()) {
            debug!(rank = self.rank, candidate = ?progress.best(), "best slot kept");
            return Ok(false);
        }

        let prefix = self.best_prefix();
        if checkpoint.is_none() {
            self.publisher.delete_prefix(&prefix).await?;
        }
        if let Some(bytes) = checkpoint {
            self.publisher.publish(CHECKPOINT_FILE, bytes, &prefix).await?;
        }
        self.publisher.publish_json(PROGRESS_FILE, progress, &prefix).await?;
        self.publisher
            .publish_json(HYPERPARAMETERS_FILE, draw, &prefix)
            .await?;
        info!(
            rank = self.rank,
            metric = %progress.compare(),
            best = ?progress.best(),
            previous = ?incumbent.as_ref().and_then(ProgressRecord::best),
            "new best result"
        );
        Ok(true)
    }

    // -- reports ------------------------------------------------------------

    pub async fn publish_trial_results(
        &self,
        progress: &ProgressRecord,
        draw: &HyperparameterDraw,
        time: DateTime<Utc>,
    ) -> SlResult<()> {
        let record = ResultsRecord::new(progress.clone(), draw.clone(), time);
        let name = trial_results_name(time, self.rank, draw.current_iter());
        self.publisher
            .publish_json(&name, &record, &self.results_prefix())
            .await
    }

    pub async fn publish_final_results(
        &self,
        progress: &ProgressRecord,
        draw: &HyperparameterDraw,
        time: DateTime<Utc>,
    ) -> SlResult<()> {
        let record = ResultsRecord::new(progress.clone(), draw.clone(), time);
        let name = final_results_name(time, self.rank);
        self.publisher
            .publish_json(&name, &record, &self.results_prefix())
            .await
    }

    pub async fn publish_trial_error(
        &self,
        iteration: usize,
        report: &TrialErrorReport,
        time: DateTime<Utc>,
    ) -> SlResult<()> {
        let name = trial_error_name(time, self.rank, iteration);
        self.publisher
            .publish_json(&name, report, &Category::SharedErrors.prefix())
            .await
    }
}
