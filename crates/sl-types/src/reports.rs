//! Durable report documents written to the results and shared-errors channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hyperparams::{Assignment, HyperparameterDraw};
use crate::layout::{readable_stamp, Rank};
use crate::progress::ProgressRecord;

/// Written to the shared error channel when a trial fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialErrorReport {
    pub error: String,
    pub hyperparameters: Assignment,
    pub progress: ProgressRecord,
    pub time: String,
}

impl TrialErrorReport {
    pub fn new(
        error: impl ToString,
        hyperparameters: Assignment,
        progress: ProgressRecord,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            error: error.to_string(),
            hyperparameters,
            progress,
            time: readable_stamp(time),
        }
    }
}

/// Outcome of a trial (or of a whole search) together with the raw draw that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsRecord {
    pub progress: ProgressRecord,
    pub hyperparameters: HyperparameterDraw,
    pub time: String,
}

impl ResultsRecord {
    pub fn new(progress: ProgressRecord, hyperparameters: HyperparameterDraw, time: DateTime<Utc>) -> Self {
        Self {
            progress,
            hyperparameters,
            time: readable_stamp(time),
        }
    }
}

/// Written by the fleet provisioner when fewer workers were built than requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortfallReport {
    pub error: String,
    pub built: usize,
    pub requested: usize,
    pub remaining_ranks: Vec<Rank>,
    pub time: String,
}

impl ShortfallReport {
    pub fn new(built: usize, requested: usize, remaining_ranks: Vec<Rank>, time: DateTime<Utc>) -> Self {
        Self {
            error: format!(
                "{built}/{requested} workers built. All desired hyperparameters could not be explored"
            ),
            built,
            requested,
            remaining_ranks,
            time: readable_stamp(time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperparams::HyperparameterSpec;
    use chrono::TimeZone;

    #[test]
    fn shortfall_message() {
        let time = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();
        let report = ShortfallReport::new(0, 2, vec![0, 1], time);
        assert!(report.error.starts_with("0/2 workers built"));
        assert_eq!(report.time, "10/19/2026-08:30:00");

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["remaining_ranks"], serde_json::json!([0, 1]));
    }

    #[test]
    fn results_record_embeds_raw_draw() {
        let draw = HyperparameterDraw::new(HyperparameterSpec::new().add_range("lr", 0.0, 1.0), 3);
        let record = ResultsRecord::new(ProgressRecord::new().with_value("val_accuracy", 0.9), draw, Utc::now());

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["hyperparameters"]["max_iter"], 3);
        assert_eq!(value["progress"]["val_accuracy"], serde_json::json!([0.9]));
        assert!(value["time"].is_string());
    }
}
