//! The per-worker search loop.
//!
//! A worker owns exactly one rank. It repeatedly runs a trial with the
//! current draw, records the outcome, advances the draw and persists enough
//! state after every transition that a restarted worker picks up where the
//! previous one stopped.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sl_store::BufferedPublisher;
use sl_types::{
    internal_error, HyperparameterDraw, ProgressRecord, Rank, SlResult, StateError, TrialError,
    TrialErrorReport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::slots::RankSlots;
use crate::trial::{TrialContext, TrialExecutor, TrialOutput};

/// Where the loop is.
#[derive(Debug)]
pub enum LoopState {
    /// Load (first entry) or reuse the draw and progress for the next trial.
    Resuming,
    RunningTrial,
    TrialOk(TrialOutput),
    TrialFailed(TrialError),
    Advancing,
    /// Terminal. Finalization happens on the first step taken here.
    Done,
}

impl LoopState {
    pub fn name(&self) -> &'static str {
        match self {
            LoopState::Resuming => "resuming",
            LoopState::RunningTrial => "running_trial",
            LoopState::TrialOk(_) => "trial_ok",
            LoopState::TrialFailed(_) => "trial_failed",
            LoopState::Advancing => "advancing",
            LoopState::Done => "done",
        }
    }
}

/// What one worker did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSummary {
    pub rank: Rank,
    /// Trials executed by this process, failed ones included.
    pub trials_run: usize,
    pub trials_failed: usize,
    pub best_updates: usize,
    pub final_iter: usize,
    /// Whether this process wrote the end-of-search results.
    pub finalized: bool,
}

pub struct SearchLoop<E: TrialExecutor> {
    slots: RankSlots,
    executor: E,
    rng: StdRng,
    state: LoopState,
    draw: Option<HyperparameterDraw>,
    progress: ProgressRecord,
    checkpoint: Option<PathBuf>,
    /// The most recent trial in this process failed.
    last_trial_failed: bool,
    halted: bool,
    summary: SearchSummary,
}

impl<E: TrialExecutor> SearchLoop<E> {
    pub fn new(rank: Rank, publisher: Arc<BufferedPublisher>, executor: E) -> Self {
        Self {
            slots: RankSlots::new(rank, publisher),
            executor,
            rng: StdRng::from_os_rng(),
            state: LoopState::Resuming,
            draw: None,
            progress: ProgressRecord::new(),
            checkpoint: None,
            last_trial_failed: false,
            halted: false,
            summary: SearchSummary {
                rank,
                ..Default::default()
            },
        }
    }

    /// Deterministic sampling.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn rank(&self) -> Rank {
        self.slots.rank()
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn draw(&self) -> Option<&HyperparameterDraw> {
        self.draw.as_ref()
    }

    pub fn progress(&self) -> &ProgressRecord {
        &self.progress
    }

    pub fn summary(&self) -> &SearchSummary {
        &self.summary
    }

    /// Drive the loop to completion.
    pub async fn run(&mut self) -> SlResult<SearchSummary> {
        info!(rank = self.rank(), executor = self.executor.name(), "starting search loop");
        while self.step().await? {}
        info!(
            rank = self.rank(),
            trials = self.summary.trials_run,
            failed = self.summary.trials_failed,
            best_updates = self.summary.best_updates,
            "search loop finished"
        );
        Ok(self.summary.clone())
    }

    /// Take one transition. Returns `false` once the loop has halted.
    pub async fn step(&mut self) -> SlResult<bool> {
        if self.halted {
            return Ok(false);
        }

        let state = std::mem::replace(&mut self.state, LoopState::Done);
        debug!(rank = self.rank(), state = state.name(), "step");

        self.state = match state {
            LoopState::Resuming => self.resume().await?,
            LoopState::RunningTrial => self.run_trial().await?,
            LoopState::TrialOk(output) => self.trial_succeeded(output).await?,
            LoopState::TrialFailed(err) => self.trial_failed(err).await?,
            LoopState::Advancing => self.advance().await?,
            LoopState::Done => {
                self.finalize().await?;
                self.halted = true;
                LoopState::Done
            }
        };
        Ok(!self.halted)
    }

    async fn resume(&mut self) -> SlResult<LoopState> {
        if let Some(draw) = &self.draw {
            return Ok(if draw.is_complete() {
                LoopState::Done
            } else {
                LoopState::RunningTrial
            });
        }

        let mut draw = self.slots.load_draw().await?;
        let progress = self.slots.load_progress().await?;
        let rank = self.rank();

        if draw.current_values().is_some() {
            let checkpoint = self.slots.load_checkpoint().await?;
            if checkpoint.is_some() && progress.is_none() {
                return Err(StateError::Inconsistent {
                    message: format!(
                        "{} holds a checkpoint but no progress record",
                        self.slots.trial_prefix()
                    ),
                }
                .into());
            }
            self.checkpoint = checkpoint;
        }
        self.progress = progress.unwrap_or_default();

        info!(
            rank,
            iteration = draw.current_iter(),
            max_iter = draw.max_iter(),
            resumed = draw.current_values().is_some(),
            "loaded worker state"
        );

        if draw.is_complete() {
            self.draw = Some(draw);
            return Ok(LoopState::Done);
        }

        let fresh = draw.current_values().is_none();
        draw.prepare(&mut self.rng);
        if fresh {
            self.slots.save_draw(&draw).await?;
        }
        self.draw = Some(draw);
        Ok(LoopState::RunningTrial)
    }

    async fn run_trial(&mut self) -> SlResult<LoopState> {
        let draw = self
            .draw
            .as_ref()
            .ok_or_else(|| internal_error!("trial started without a draw"))?;
        let values = draw
            .current_values()
            .ok_or_else(|| internal_error!("trial started without sampled values"))?;
        let checkpoint = if draw.should_load_checkpoint() {
            self.checkpoint.take()
        } else {
            None
        };

        info!(
            rank = self.slots.rank(),
            iteration = draw.current_iter(),
            resumed = checkpoint.is_some(),
            hyperparameters = ?values,
            "running trial"
        );

        let mut ctx = TrialContext::new(draw, values, checkpoint, &mut self.progress, &self.slots);
        Ok(match self.executor.run(&mut ctx).await {
            Ok(output) => LoopState::TrialOk(output),
            Err(err) => LoopState::TrialFailed(err),
        })
    }

    async fn trial_succeeded(&mut self, output: TrialOutput) -> SlResult<LoopState> {
        let draw = self
            .draw
            .as_ref()
            .ok_or_else(|| internal_error!("trial finished without a draw"))?;
        self.summary.trials_run += 1;
        self.last_trial_failed = false;

        self.slots
            .save_working(Some(output.checkpoint.as_slice()), &self.progress, draw)
            .await?;
        self.slots
            .publish_trial_results(&self.progress, draw, Utc::now())
            .await?;

        match self
            .slots
            .update_best(&self.progress, draw, Some(output.checkpoint.as_slice()))
            .await
        {
            Ok(true) => self.summary.best_updates += 1,
            Ok(false) => {}
            Err(e) => warn!(rank = self.slots.rank(), error = %e, "best slot unreadable, keeping incumbent"),
        }

        info!(
            rank = self.slots.rank(),
            iteration = draw.current_iter(),
            best = ?self.progress.best(),
            "trial complete"
        );
        Ok(LoopState::Advancing)
    }

    async fn trial_failed(&mut self, err: TrialError) -> SlResult<LoopState> {
        let draw = self
            .draw
            .as_ref()
            .ok_or_else(|| internal_error!("trial failed without a draw"))?;
        self.summary.trials_run += 1;
        self.summary.trials_failed += 1;
        self.last_trial_failed = true;

        error!(
            rank = self.slots.rank(),
            iteration = draw.current_iter(),
            error = %err,
            "trial failed"
        );

        let now = Utc::now();
        let report = TrialErrorReport::new(
            &err,
            draw.current_values().cloned().unwrap_or_default(),
            self.progress.clone(),
            now,
        );
        self.slots
            .publish_trial_error(draw.current_iter(), &report, now)
            .await?;
        Ok(LoopState::Advancing)
    }

    async fn advance(&mut self) -> SlResult<LoopState> {
        let draw = self
            .draw
            .as_mut()
            .ok_or_else(|| internal_error!("advance without a draw"))?;
        draw.advance(&mut self.rng)?;

        if draw.is_complete() {
            // A successful last trial stays for finalize. A failed one is
            // dropped so it never competes for the best slot.
            if self.last_trial_failed {
                self.slots.clear_trial().await?;
            }
            self.slots.save_draw(draw).await?;
            return Ok(LoopState::Done);
        }

        // The draw is written last: until then a restart re-runs the
        // previous iteration instead of finding no draw.
        self.slots.clear_trial().await?;
        self.checkpoint = None;
        self.progress = self.progress.fresh();
        self.slots.save_progress(&self.progress).await?;
        self.slots.save_draw(draw).await?;

        debug!(rank = self.slots.rank(), iteration = draw.current_iter(), "advanced draw");
        Ok(LoopState::Resuming)
    }

    async fn finalize(&mut self) -> SlResult<()> {
        let Some(draw) = &self.draw else {
            return Ok(());
        };
        self.summary.final_iter = draw.current_iter();
        if draw.current_values().is_none() {
            debug!(rank = self.slots.rank(), "search already finalized");
            // Leftovers of a finalize interrupted after the draw was cleared.
            return self.slots.clear_trial().await;
        }

        self.slots
            .publish_final_results(&self.progress, draw, Utc::now())
            .await?;

        if self.last_trial_failed {
            debug!(rank = self.slots.rank(), "last trial failed, best slot kept");
        } else {
            let checkpoint = self.slots.checkpoint_bytes().await?;
            match self
                .slots
                .update_best(&self.progress, draw, checkpoint.as_deref())
                .await
            {
                Ok(true) => self.summary.best_updates += 1,
                Ok(false) => {}
                Err(e) => warn!(rank = self.slots.rank(), error = %e, "best slot unreadable, keeping incumbent"),
            }
        }

        self.slots.save_draw(&draw.cleared()).await?;
        self.slots.clear_trial().await?;
        self.summary.finalized = true;

        info!(rank = self.slots.rank(), iteration = draw.current_iter(), "search finalized");
        Ok(())
    }
}
