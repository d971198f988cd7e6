//! Worker configuration.

use serde::{Deserialize, Serialize};
use sl_types::{config_error, Rank, SlResult};
use std::path::PathBuf;

pub const ENV_RANK: &str = "SL_RANK";
pub const ENV_STORE_ROOT: &str = "SL_STORE_ROOT";
pub const ENV_SCRATCH_DIR: &str = "SL_SCRATCH_DIR";
pub const ENV_TRIAL_COMMAND: &str = "SL_TRIAL_COMMAND";
pub const ENV_SEED: &str = "SL_SEED";

/// Everything one worker process needs to run its search loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub rank: Rank,
    /// Root of the shared blob store (a local directory or mounted bucket).
    pub store_root: PathBuf,
    /// Local staging space for uploads, downloads and trial files.
    pub scratch_dir: PathBuf,
    /// Training command run once per trial.
    pub trial_command: String,
    /// Fixed sampling seed; sampled from the OS when absent.
    pub seed: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            store_root: PathBuf::from("./store"),
            scratch_dir: PathBuf::from("./tmp"),
            trial_command: String::new(),
            seed: None,
        }
    }
}

impl WorkerConfig {
    pub fn new(rank: Rank, store_root: impl Into<PathBuf>, trial_command: impl Into<String>) -> Self {
        Self {
            rank,
            store_root: store_root.into(),
            trial_command: trial_command.into(),
            ..Default::default()
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> SlResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. `SL_RANK`, `SL_STORE_ROOT`
    /// and `SL_TRIAL_COMMAND` are required.
    pub fn from_lookup<F>(lookup: F) -> SlResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| config_error!("{} is not set", key))
        };

        let rank_raw = require(ENV_RANK)?;
        let rank = rank_raw
            .trim()
            .parse::<Rank>()
            .map_err(|e| config_error!("{}={:?}: {}", ENV_RANK, rank_raw, e))?;

        let seed = match lookup(ENV_SEED).filter(|v| !v.trim().is_empty()) {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u64>()
                    .map_err(|e| config_error!("{}={:?}: {}", ENV_SEED, raw, e))?,
            ),
            None => None,
        };

        let mut config = Self::new(rank, require(ENV_STORE_ROOT)?, require(ENV_TRIAL_COMMAND)?);
        if let Some(dir) = lookup(ENV_SCRATCH_DIR).filter(|v| !v.trim().is_empty()) {
            config.scratch_dir = PathBuf::from(dir);
        }
        config.seed = seed;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SlResult<()> {
        if self.trial_command.trim().is_empty() {
            return Err(config_error!("trial command must not be empty"));
        }
        if self.store_root.as_os_str().is_empty() {
            return Err(config_error!("store root must not be empty"));
        }
        if self.scratch_dir.as_os_str().is_empty() {
            return Err(config_error!("scratch directory must not be empty"));
        }
        if self.store_root == self.scratch_dir {
            return Err(config_error!(
                "scratch directory must differ from the store root ({})",
                self.store_root.display()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_types::SlError;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn reads_required_and_optional_variables() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("SL_RANK", "3"),
            ("SL_STORE_ROOT", "/mnt/bucket"),
            ("SL_TRIAL_COMMAND", "python3 train.py"),
            ("SL_SEED", "42"),
        ]))
        .unwrap();

        assert_eq!(config.rank, 3);
        assert_eq!(config.store_root, PathBuf::from("/mnt/bucket"));
        assert_eq!(config.scratch_dir, PathBuf::from("./tmp"));
        assert_eq!(config.seed, Some(42));
    }

    #[test]
    fn missing_or_invalid_values_are_config_errors() {
        let err = WorkerConfig::from_lookup(lookup(&[("SL_RANK", "1")])).unwrap_err();
        assert!(matches!(err, SlError::Config(_)));
        assert!(err.to_string().contains("SL_STORE_ROOT"));

        let err = WorkerConfig::from_lookup(lookup(&[
            ("SL_RANK", "-1"),
            ("SL_STORE_ROOT", "/mnt/bucket"),
            ("SL_TRIAL_COMMAND", "train"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SL_RANK"));
    }

    #[test]
    fn scratch_must_not_alias_the_store() {
        let config = WorkerConfig::new(0, "/data", "train").with_scratch_dir("/data");
        assert!(config.validate().is_err());
        assert!(WorkerConfig::new(0, "/data", "train").with_seed(1).validate().is_ok());
    }
}
