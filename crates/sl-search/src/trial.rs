//! The trial executor seam: what a worker hands to one training run and
//! what it gets back.

use async_trait::async_trait;
use sl_types::{Assignment, Goal, HyperparameterDraw, ProgressRecord, Rank, SlResult, TrialError};
use std::path::{Path, PathBuf};

use crate::slots::RankSlots;

/// Everything a trial can see and touch while it runs.
///
/// The progress record is borrowed exclusively for the duration of the
/// trial; the executor is its only writer.
pub struct TrialContext<'a> {
    draw: &'a HyperparameterDraw,
    hyperparameters: &'a Assignment,
    checkpoint: Option<PathBuf>,
    progress: &'a mut ProgressRecord,
    slots: &'a RankSlots,
}

impl<'a> TrialContext<'a> {
    pub fn new(
        draw: &'a HyperparameterDraw,
        hyperparameters: &'a Assignment,
        checkpoint: Option<PathBuf>,
        progress: &'a mut ProgressRecord,
        slots: &'a RankSlots,
    ) -> Self {
        Self {
            draw,
            hyperparameters,
            checkpoint,
            progress,
            slots,
        }
    }

    pub fn rank(&self) -> Rank {
        self.slots.rank()
    }

    pub fn iteration(&self) -> usize {
        self.draw.current_iter()
    }

    pub fn hyperparameters(&self) -> &Assignment {
        self.hyperparameters
    }

    /// Checkpoint of the interrupted trial this one resumes, if any.
    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint.as_deref()
    }

    /// First epoch to run: past whatever the progress record already holds.
    pub fn start_epoch(&self) -> usize {
        self.progress.next_epoch()
    }

    /// Local scratch space for the trial's own files.
    pub fn scratch_dir(&self) -> &Path {
        self.slots.publisher().scratch_dir()
    }

    pub fn progress(&self) -> &ProgressRecord {
        &*self.progress
    }

    /// Append one observation to the progress record.
    pub fn record(&mut self, metric: impl Into<String>, value: f64) {
        self.progress.record(metric, value);
    }

    pub fn set_compare_goal(&mut self, compare: impl Into<String>, goal: Goal) {
        self.progress.set_compare_goal(compare, goal);
    }

    /// Persist a mid-trial checkpoint together with the current progress and
    /// draw, so an interrupted worker resumes from here.
    pub async fn save_checkpoint(&self, bytes: &[u8]) -> SlResult<()> {
        self.slots
            .save_working(Some(bytes), &*self.progress, self.draw)
            .await
    }
}

/// What a successful trial leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialOutput {
    /// Opaque checkpoint of the trained model.
    pub checkpoint: Vec<u8>,
}

impl TrialOutput {
    pub fn new(checkpoint: Vec<u8>) -> Self {
        Self { checkpoint }
    }
}

/// Runs one training trial.
#[async_trait]
pub trait TrialExecutor: Send + Sync {
    async fn run(&self, ctx: &mut TrialContext<'_>) -> Result<TrialOutput, TrialError>;

    /// Get executor name
    fn name(&self) -> &str;
}
