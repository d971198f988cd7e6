//! Fleet setup for a distributed hyperparameter search: seeding per-worker
//! draws, staging shared artifacts and provisioning worker instances with
//! zone fallback.

pub mod provisioner;
pub mod seeding;
pub mod staging;

pub use provisioner::{
    AttemptOutcome, ComputeProvider, FleetProvisioner, FleetRequest, MachineConfig,
    OperationHandle, ProvisionReport,
};
pub use seeding::{seed_search, SearchPlan};
pub use staging::{clear_worker_progress, stage_access_token, stage_dataset};
