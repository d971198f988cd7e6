//! Per-worker hyperparameter search: the resumable search loop, the trial
//! executor seam and the working/best slot persistence it relies on.

pub mod command;
pub mod config;
pub mod slots;
pub mod trial;
pub mod worker;

pub use command::CommandTrial;
pub use config::WorkerConfig;
pub use slots::RankSlots;
pub use trial::{TrialContext, TrialExecutor, TrialOutput};
pub use worker::{LoopState, SearchLoop, SearchSummary};
