//! Fleet provisioning with per-zone fallback.
//!
//! Each pass assigns the remaining ranks round-robin over the zones that are
//! still considered valid, creates every instance, then waits for each
//! accepted creation. Any failure in a zone retires that zone and re-queues
//! the rank for the next pass. Zone exhaustion is the dominant failure mode,
//! so a zone is never retried once it has failed.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sl_store::BufferedPublisher;
use sl_types::{
    Category, ProvisionError, Rank, ShortfallReport, SlResult, CLUSTER_ERROR_FILE,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Machine configuration handed to the provider. `zones` is the ordered list
/// of candidate zones; every other field is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub zones: Vec<String>,
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl MachineConfig {
    pub fn new(zones: Vec<String>) -> Self {
        Self {
            zones,
            settings: serde_json::Map::new(),
        }
    }

    pub fn with_setting(mut self, key: &str, value: serde_json::Value) -> Self {
        self.settings.insert(key.to_string(), value);
        self
    }

    /// Load a machine configuration document from disk.
    pub fn load(path: &Path) -> SlResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Provider-issued handle for an in-flight instance creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle {
    pub name: String,
}

impl OperationHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Compute provider interface.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Request one worker instance. Fails immediately when the request is rejected.
    async fn create_instance(
        &self,
        project: &str,
        machine: &MachineConfig,
        startup_script: &str,
        zone: &str,
        rank: Rank,
    ) -> Result<OperationHandle, ProvisionError>;

    /// Block until the operation finishes; `true` when the instance is running.
    async fn wait_for_operation(
        &self,
        project: &str,
        operation: &OperationHandle,
        zone: &str,
    ) -> Result<bool, ProvisionError>;
}

/// Everything needed to build a fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetRequest {
    pub project: String,
    pub workers: usize,
    pub machine: MachineConfig,
    pub startup_script: String,
}

impl FleetRequest {
    pub fn new(project: impl Into<String>, workers: usize, machine: MachineConfig) -> Self {
        Self {
            project: project.into(),
            workers,
            machine,
            startup_script: String::new(),
        }
    }

    pub fn with_startup_script(mut self, script: impl Into<String>) -> Self {
        self.startup_script = script.into();
        self
    }
}

/// Result of a single (rank, zone) attempt within a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The instance is running.
    Succeeded { rank: Rank, zone: String },
    /// The provider rejected the creation request.
    ZoneExhausted { rank: Rank, zone: String },
    /// The creation was accepted but did not complete.
    Failed { rank: Rank, zone: String },
    /// No valid zone was left to try this rank in.
    Unassigned { rank: Rank },
}

impl AttemptOutcome {
    pub fn rank(&self) -> Rank {
        match self {
            Self::Succeeded { rank, .. }
            | Self::ZoneExhausted { rank, .. }
            | Self::Failed { rank, .. }
            | Self::Unassigned { rank } => *rank,
        }
    }
}

/// Summary of a provisioning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub requested: usize,
    pub built: usize,
    /// Zone each successfully built rank landed in.
    pub placements: BTreeMap<Rank, String>,
    /// Ranks that could not be built, ascending.
    pub remaining_ranks: Vec<Rank>,
    /// Zones retired after a failure, in retirement order.
    pub exhausted_zones: Vec<String>,
    pub passes: usize,
}

impl ProvisionReport {
    pub fn is_complete(&self) -> bool {
        self.built == self.requested
    }
}

/// Builds worker fleets through a [`ComputeProvider`] and reports shortfalls
/// to the shared error channel.
pub struct FleetProvisioner<P: ComputeProvider> {
    provider: P,
    publisher: Arc<BufferedPublisher>,
}

impl<P: ComputeProvider> FleetProvisioner<P> {
    pub fn new(provider: P, publisher: Arc<BufferedPublisher>) -> Self {
        Self {
            provider,
            publisher,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Create `request.workers` instances, falling back across zones.
    ///
    /// A partial fleet is not an error: the shortfall is published and
    /// reported. Only a failure to publish the shortfall report is returned
    /// as an error.
    pub async fn build(&self, request: &FleetRequest) -> SlResult<ProvisionReport> {
        info!(
            project = %request.project,
            workers = request.workers,
            zones = ?request.machine.zones,
            "building worker fleet"
        );

        let mut valid_zones = request.machine.zones.clone();
        let mut remaining: Vec<Rank> = (0..request.workers).collect();
        let mut placements = BTreeMap::new();
        let mut exhausted_zones = Vec::new();
        let mut passes = 0;

        while !remaining.is_empty() && !valid_zones.is_empty() {
            passes += 1;
            let outcomes = self.run_pass(request, &remaining, &mut valid_zones).await;

            let mut retry = Vec::new();
            for outcome in outcomes {
                match outcome {
                    AttemptOutcome::Succeeded { rank, zone } => {
                        placements.insert(rank, zone);
                    }
                    AttemptOutcome::ZoneExhausted { rank, zone }
                    | AttemptOutcome::Failed { rank, zone } => {
                        if !exhausted_zones.contains(&zone) {
                            exhausted_zones.push(zone);
                        }
                        retry.push(rank);
                    }
                    AttemptOutcome::Unassigned { rank } => retry.push(rank),
                }
            }
            retry.sort_unstable();
            remaining = retry;
        }

        let report = ProvisionReport {
            requested: request.workers,
            built: request.workers - remaining.len(),
            placements,
            remaining_ranks: remaining,
            exhausted_zones,
            passes,
        };

        if !report.is_complete() {
            self.publish_shortfall(&report).await?;
        }
        info!(
            built = report.built,
            requested = report.requested,
            passes = report.passes,
            "{}/{} workers built",
            report.built,
            report.requested
        );
        Ok(report)
    }

    /// One pass: issue every creation, then drain the waits.
    async fn run_pass(
        &self,
        request: &FleetRequest,
        ranks: &[Rank],
        valid_zones: &mut Vec<String>,
    ) -> Vec<AttemptOutcome> {
        let mut outcomes = Vec::with_capacity(ranks.len());
        let mut accepted = Vec::new();

        for (idx, &rank) in ranks.iter().enumerate() {
            if valid_zones.is_empty() {
                outcomes.push(AttemptOutcome::Unassigned { rank });
                continue;
            }
            let zone = valid_zones[idx % valid_zones.len()].clone();

            match self
                .provider
                .create_instance(
                    &request.project,
                    &request.machine,
                    &request.startup_script,
                    &zone,
                    rank,
                )
                .await
            {
                Ok(operation) => accepted.push((rank, zone, operation)),
                Err(e) => {
                    warn!(rank, zone = %zone, error = %e, "failed to create worker, retiring zone");
                    valid_zones.retain(|z| z != &zone);
                    outcomes.push(AttemptOutcome::ZoneExhausted { rank, zone });
                }
            }
        }

        for (rank, zone, operation) in accepted {
            let passed = match self
                .provider
                .wait_for_operation(&request.project, &operation, &zone)
                .await
            {
                Ok(passed) => passed,
                Err(e) => {
                    warn!(rank, zone = %zone, error = %e, "error while waiting for worker");
                    false
                }
            };

            if passed {
                info!(rank, zone = %zone, "worker running");
                outcomes.push(AttemptOutcome::Succeeded { rank, zone });
            } else {
                warn!(rank, zone = %zone, operation = %operation.name, "worker did not start, retiring zone");
                valid_zones.retain(|z| z != &zone);
                outcomes.push(AttemptOutcome::Failed { rank, zone });
            }
        }

        outcomes
    }

    async fn publish_shortfall(&self, report: &ProvisionReport) -> SlResult<()> {
        let shortfall = ShortfallReport::new(
            report.built,
            report.requested,
            report.remaining_ranks.clone(),
            Utc::now(),
        );
        warn!(error = %shortfall.error, "writing shortfall to shared errors");
        self.publisher
            .publish_json(
                CLUSTER_ERROR_FILE,
                &shortfall,
                &Category::SharedErrors.prefix(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sl_store::MemoryBlobStore;
    use std::collections::HashSet;
    use tempfile::{tempdir, TempDir};

    /// Scripted provider: zones in `reject` refuse creation, zones in
    /// `stall` accept creation but never complete, zones in `broken` fail
    /// while being waited on.
    #[derive(Default)]
    struct FakeProvider {
        reject: HashSet<String>,
        stall: HashSet<String>,
        broken: HashSet<String>,
        created: Mutex<Vec<(Rank, String)>>,
    }

    impl FakeProvider {
        fn rejecting(zones: &[&str]) -> Self {
            Self {
                reject: zones.iter().map(|z| z.to_string()).collect(),
                ..Default::default()
            }
        }

        fn stalling(zones: &[&str]) -> Self {
            Self {
                stall: zones.iter().map(|z| z.to_string()).collect(),
                ..Default::default()
            }
        }

        fn breaking(zones: &[&str]) -> Self {
            Self {
                broken: zones.iter().map(|z| z.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ComputeProvider for FakeProvider {
        async fn create_instance(
            &self,
            _project: &str,
            _machine: &MachineConfig,
            _startup_script: &str,
            zone: &str,
            rank: Rank,
        ) -> Result<OperationHandle, ProvisionError> {
            self.created.lock().push((rank, zone.to_string()));
            if self.reject.contains(zone) {
                return Err(ProvisionError::Rejected {
                    zone: zone.to_string(),
                    message: "ZONE_RESOURCE_POOL_EXHAUSTED".to_string(),
                });
            }
            Ok(OperationHandle::new(uuid::Uuid::new_v4().to_string()))
        }

        async fn wait_for_operation(
            &self,
            _project: &str,
            operation: &OperationHandle,
            zone: &str,
        ) -> Result<bool, ProvisionError> {
            if self.broken.contains(zone) {
                return Err(ProvisionError::OperationFailed {
                    operation: operation.name.clone(),
                    zone: zone.to_string(),
                    message: "QUOTA_EXCEEDED".to_string(),
                });
            }
            Ok(!self.stall.contains(zone))
        }
    }

    fn setup(provider: FakeProvider) -> (TempDir, Arc<MemoryBlobStore>, FleetProvisioner<FakeProvider>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let publisher = Arc::new(BufferedPublisher::new(dir.path(), store.clone()).unwrap());
        (dir, store, FleetProvisioner::new(provider, publisher))
    }

    fn request(workers: usize, zones: &[&str]) -> FleetRequest {
        let machine = MachineConfig::new(zones.iter().map(|z| z.to_string()).collect())
            .with_setting("machine_type", serde_json::json!("n1-standard-4"));
        FleetRequest::new("proj", workers, machine).with_startup_script("#!/bin/sh\n")
    }

    #[tokio::test]
    async fn falls_back_to_second_zone() {
        let (_dir, store, provisioner) = setup(FakeProvider::rejecting(&["z1"]));

        let report = provisioner.build(&request(3, &["z1", "z2"])).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.built, 3);
        assert!(report.placements.values().all(|z| z == "z2"));
        assert_eq!(report.exhausted_zones, vec!["z1".to_string()]);
        assert_eq!(report.passes, 2);
        assert!(!store.contains("shared-errors", CLUSTER_ERROR_FILE));

        // z1 is tried exactly once, then never again.
        let created = provisioner.provider().created.lock().clone();
        assert_eq!(created.iter().filter(|(_, z)| z == "z1").count(), 1);
        assert_eq!(created[0], (0, "z1".to_string()));
    }

    #[tokio::test]
    async fn single_failing_zone_reports_shortfall() {
        let (dir, store, provisioner) = setup(FakeProvider::rejecting(&["z1"]));

        let report = provisioner.build(&request(2, &["z1"])).await.unwrap();

        assert_eq!(report.built, 0);
        assert_eq!(report.remaining_ranks, vec![0, 1]);
        assert!(store.contains("shared-errors", CLUSTER_ERROR_FILE));

        let publisher = BufferedPublisher::new(dir.path(), store.clone()).unwrap();
        let shortfall: ShortfallReport = publisher
            .fetch_json("shared-errors", CLUSTER_ERROR_FILE)
            .await
            .unwrap();
        assert!(shortfall.error.starts_with("0/2 workers built"));
        assert_eq!(shortfall.remaining_ranks, vec![0, 1]);
    }

    #[tokio::test]
    async fn completion_failure_retires_zone() {
        let (_dir, _store, provisioner) = setup(FakeProvider::stalling(&["z2"]));

        let report = provisioner.build(&request(4, &["z1", "z2", "z3"])).await.unwrap();

        assert!(report.is_complete());
        assert!(report.placements.values().all(|z| z != "z2"));
        assert_eq!(report.exhausted_zones, vec!["z2".to_string()]);
        // Rank 1 was first placed in z2, then retried elsewhere.
        let created = provisioner.provider().created.lock().clone();
        assert!(created.contains(&(1, "z2".to_string())));
        assert_ne!(report.placements[&1], "z2");
    }

    #[tokio::test]
    async fn wait_error_counts_as_failed_completion() {
        let (_dir, store, provisioner) = setup(FakeProvider::breaking(&["z1"]));

        let report = provisioner.build(&request(2, &["z1", "z2"])).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.placements[&0], "z2");
        assert_eq!(report.placements[&1], "z2");
        assert_eq!(report.exhausted_zones, vec!["z1".to_string()]);
        assert_eq!(report.passes, 2);
        assert!(!store.contains("shared-errors", CLUSTER_ERROR_FILE));
    }

    #[tokio::test]
    async fn every_zone_failing_stops_with_partial_fleet() {
        let (_dir, store, provisioner) = setup(FakeProvider::stalling(&["z1", "z2"]));

        let report = provisioner.build(&request(3, &["z1", "z2"])).await.unwrap();

        assert_eq!(report.built, 0);
        assert_eq!(report.remaining_ranks, vec![0, 1, 2]);
        assert_eq!(report.passes, 1);
        assert!(store.contains("shared-errors", CLUSTER_ERROR_FILE));
    }

    #[tokio::test]
    async fn empty_request_builds_nothing() {
        let (_dir, store, provisioner) = setup(FakeProvider::default());
        let report = provisioner.build(&request(0, &["z1"])).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.passes, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn machine_config_keeps_provider_settings() {
        let doc = serde_json::json!({
            "zones": ["us-central1-a", "us-central1-b"],
            "machine_type": "n1-standard-8",
            "gpus": 1
        });
        let config: MachineConfig = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(config.zones.len(), 2);
        assert_eq!(config.settings["gpus"], 1);
        assert_eq!(serde_json::to_value(&config).unwrap(), doc);
    }
}
