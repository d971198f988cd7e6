//! Blob store layout shared by the provisioner, the seeding tools and the workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer identifier of one worker; also the partition key for per-worker state.
pub type Rank = usize;

/// Draw document of a slot.
pub const HYPERPARAMETERS_FILE: &str = "hyperparameters.json";
/// Progress record of a slot.
pub const PROGRESS_FILE: &str = "progress.json";
/// Opaque trial checkpoint of a slot.
pub const CHECKPOINT_FILE: &str = "checkpoint.bin";
/// Sub-directory of the working slot holding the running trial's progress
/// and checkpoint. The draw sits one level up.
pub const TRIAL_DIR: &str = "trial";
/// Shortfall report written by the fleet provisioner.
pub const CLUSTER_ERROR_FILE: &str = "cluster-startup-err.json";

/// Top-level storage categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Staged training data archives.
    Data,
    /// Working slot of each rank: the draw, plus the running trial's
    /// progress and checkpoint under `trial/`.
    VmProgress,
    /// Best-result slot of each rank.
    BestModels,
    /// Per-trial and end-of-search results records.
    Results,
    /// Trial failures and provisioning shortfalls, shared by every rank.
    SharedErrors,
    /// Access tokens needed by worker startup scripts.
    Secrets,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Data => "data",
            Category::VmProgress => "vm-progress",
            Category::BestModels => "best-models",
            Category::Results => "results",
            Category::SharedErrors => "shared-errors",
            Category::Secrets => "secrets",
        }
    }

    /// `{category}/{rank}`
    pub fn rank_prefix(&self, rank: Rank) -> String {
        format!("{}/{}", self.as_str(), rank)
    }

    /// The category root, for categories shared by every rank.
    pub fn prefix(&self) -> String {
        self.as_str().to_string()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{prefix}/{name}`, for messages and error paths.
pub fn object_path(prefix: &str, name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

/// Compact timestamp used in object names, e.g. `10192026-142501`.
pub fn file_stamp(time: DateTime<Utc>) -> String {
    time.format("%m%d%Y-%H%M%S").to_string()
}

/// Human readable timestamp stored in report documents, e.g. `10/19/2026-14:25:01`.
pub fn readable_stamp(time: DateTime<Utc>) -> String {
    time.format("%m/%d/%Y-%H:%M:%S").to_string()
}

/// Object name of a trial failure report.
pub fn trial_error_name(time: DateTime<Utc>, rank: Rank, iteration: usize) -> String {
    format!("{}-vm{}-iter{}.json", file_stamp(time), rank, iteration)
}

/// Object name of a per-trial results record.
pub fn trial_results_name(time: DateTime<Utc>, rank: Rank, iteration: usize) -> String {
    format!("{}-vm{}-{}.json", file_stamp(time), rank, iteration)
}

/// Object name of the consolidated end-of-search results record.
pub fn final_results_name(time: DateTime<Utc>, rank: Rank) -> String {
    format!("{}-vm{}-final.json", file_stamp(time), rank)
}
