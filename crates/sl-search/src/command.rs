//! Trial executor that runs an external training command.
//!
//! The child receives its inputs through the environment:
//!
//! | variable              | contents                                      |
//! |-----------------------|-----------------------------------------------|
//! | `SL_HYPERPARAMETERS`  | JSON object of the sampled assignment         |
//! | `SL_RANK`             | worker rank                                   |
//! | `SL_ITERATION`        | current iteration                             |
//! | `SL_START_EPOCH`      | first epoch to run                            |
//! | `SL_CHECKPOINT_IN`    | checkpoint to resume from (only when resuming)|
//! | `SL_CHECKPOINT_OUT`   | where the child must write its checkpoint     |
//! | `SL_PROGRESS_OUT`     | JSON-lines file the child appends progress to |
//!
//! Each progress line is one of
//!
//! * `{"metric": name, "value": x}` to record an observation,
//! * `{"compare": name, "goal": "max" | "min"}` to pick the compared metric,
//! * `{"checkpoint": path}` to commit a mid-trial checkpoint.
//!
//! The file is tailed while the child runs. A checkpoint line persists the
//! named file (relative paths resolve against the trial directory) together
//! with every observation before it, so an interrupted worker resumes from
//! the last committed epoch.

use async_trait::async_trait;
use serde::Deserialize;
use sl_types::{validation_error, Goal, SlResult, TrialError, CHECKPOINT_FILE};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::trial::{TrialContext, TrialExecutor, TrialOutput};

const PROGRESS_LINES_FILE: &str = "progress.jsonl";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum ProgressLine {
    Metric { metric: String, value: f64 },
    Compare { compare: String, goal: Goal },
    Checkpoint { checkpoint: PathBuf },
}

/// Runs each trial as a child process.
#[derive(Debug, Clone)]
pub struct CommandTrial {
    program: String,
    args: Vec<String>,
    poll_interval: Duration,
}

impl CommandTrial {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// How often the progress file is read while the child runs.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Parse a whitespace separated command line. No shell quoting is applied.
    pub fn from_command_line(line: &str) -> SlResult<Self> {
        let mut parts = line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| validation_error!("trial command is empty"))?;
        Ok(Self::new(program).with_args(parts))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn execute(
        &self,
        ctx: &mut TrialContext<'_>,
        trial_dir: &Path,
    ) -> Result<TrialOutput, TrialError> {
        let checkpoint_out = trial_dir.join(CHECKPOINT_FILE);
        let progress_out = trial_dir.join(PROGRESS_LINES_FILE);
        let hyperparameters =
            serde_json::to_string(ctx.hyperparameters()).map_err(|e| TrialError::SpawnFailed {
                message: format!("cannot encode hyperparameters: {e}"),
            })?;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env("SL_HYPERPARAMETERS", hyperparameters)
            .env("SL_RANK", ctx.rank().to_string())
            .env("SL_ITERATION", ctx.iteration().to_string())
            .env("SL_START_EPOCH", ctx.start_epoch().to_string())
            .env("SL_CHECKPOINT_OUT", &checkpoint_out)
            .env("SL_PROGRESS_OUT", &progress_out)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(checkpoint) = ctx.checkpoint_path() {
            command.env("SL_CHECKPOINT_IN", checkpoint);
        }

        debug!(program = %self.program, dir = %trial_dir.display(), "spawning trial");
        let mut child = command.spawn().map_err(|e| TrialError::SpawnFailed {
            message: format!("{}: {e}", self.program),
        })?;

        let mut tail = ProgressTail::new(progress_out, trial_dir.to_path_buf());
        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| TrialError::ExecutionFailed {
                        message: format!("{}: {e}", self.program),
                    })?;
                }
                _ = tokio::time::sleep(self.poll_interval) => tail.poll(ctx, false).await,
            }
        };
        // Observations are applied even when the child failed.
        tail.poll(ctx, true).await;

        if !status.success() {
            return Err(TrialError::ExecutionFailed {
                message: format!("{} exited with {status}", self.program),
            });
        }
        if let Some(err) = tail.error {
            return Err(err);
        }

        match tokio::fs::read(&checkpoint_out).await {
            Ok(checkpoint) => Ok(TrialOutput::new(checkpoint)),
            Err(e) => Err(TrialError::Checkpoint {
                message: format!("{}: {e}", checkpoint_out.display()),
            }),
        }
    }
}

/// Incremental reader over the child's progress file.
///
/// Only complete lines are applied until the final flush. The first bad line
/// stops the tail; later lines are ignored.
struct ProgressTail {
    path: PathBuf,
    trial_dir: PathBuf,
    offset: u64,
    pending: Vec<u8>,
    lines: usize,
    error: Option<TrialError>,
}

impl ProgressTail {
    fn new(path: PathBuf, trial_dir: PathBuf) -> Self {
        Self {
            path,
            trial_dir,
            offset: 0,
            pending: Vec::new(),
            lines: 0,
            error: None,
        }
    }

    async fn poll(&mut self, ctx: &mut TrialContext<'_>, flush: bool) {
        if self.error.is_some() {
            return;
        }
        match self.read_new().await {
            Ok(bytes) => self.pending.extend_from_slice(&bytes),
            Err(e) => {
                self.error = Some(TrialError::InvalidOutput {
                    message: format!("{}: {e}", self.path.display()),
                });
                return;
            }
        }

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Err(e) = self.apply(ctx, &line).await {
                self.error = Some(e);
                return;
            }
        }
        if flush && !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            if let Err(e) = self.apply(ctx, &line).await {
                self.error = Some(e);
            }
        }
    }

    async fn read_new(&mut self) -> std::io::Result<Vec<u8>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        self.offset += bytes.len() as u64;
        Ok(bytes)
    }

    async fn apply(&mut self, ctx: &mut TrialContext<'_>, raw: &[u8]) -> Result<(), TrialError> {
        self.lines += 1;
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        match serde_json::from_str::<ProgressLine>(text) {
            Ok(ProgressLine::Metric { metric, value }) => ctx.record(metric, value),
            Ok(ProgressLine::Compare { compare, goal }) => ctx.set_compare_goal(compare, goal),
            Ok(ProgressLine::Checkpoint { checkpoint }) => {
                let path = self.trial_dir.join(checkpoint);
                let bytes = tokio::fs::read(&path).await.map_err(|e| TrialError::Checkpoint {
                    message: format!("{}: {e}", path.display()),
                })?;
                ctx.save_checkpoint(&bytes)
                    .await
                    .map_err(|e| TrialError::Checkpoint {
                        message: format!("cannot commit {}: {e}", path.display()),
                    })?;
                info!(
                    rank = ctx.rank(),
                    iteration = ctx.iteration(),
                    epochs = ?ctx.progress().series("epochs").and_then(|s| s.last()),
                    "committed mid-trial checkpoint"
                );
            }
            Err(e) => {
                return Err(TrialError::InvalidOutput {
                    message: format!("progress line {}: {e}", self.lines),
                })
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TrialExecutor for CommandTrial {
    async fn run(&self, ctx: &mut TrialContext<'_>) -> Result<TrialOutput, TrialError> {
        let trial_dir: PathBuf = ctx
            .scratch_dir()
            .join(format!("trial-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&trial_dir)
            .await
            .map_err(|e| TrialError::SpawnFailed {
                message: format!("{}: {e}", trial_dir.display()),
            })?;

        let result = self.execute(ctx, &trial_dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&trial_dir).await {
            warn!(dir = %trial_dir.display(), error = %e, "failed to remove trial directory");
        }
        result
    }

    fn name(&self) -> &str {
        "command"
    }
}
