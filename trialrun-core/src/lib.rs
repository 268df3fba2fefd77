//! # trialrun-core: resumable, distributed trial execution
//!
//! Drives a user-defined [`Trial`] through the operations handed out by a
//! hyperparameter search scheduler: training in lock-step across workers,
//! validating and checkpointing on cadence, reporting to the scheduler, and
//! resuming from a stored checkpoint after preemption.
//!
//! ## Layout
//!
//! - [`trial`]: the contract user code implements
//! - [`training`]: controller, cadence, metrics, callbacks and checkpoint bundles
//! - [`distributed`]: collectives shared by the workers of one trial
//! - [`searcher`], [`storage`], [`preemption`], [`metric_writer`]: external collaborators

pub mod config;
pub mod context;
pub mod distributed;
pub mod error;
pub mod metric_writer;
pub mod persistence;
pub mod preemption;
pub mod rng;
pub mod searcher;
pub mod storage;
pub mod training;
pub mod trial;

/// Version written into checkpoint metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports
pub use config::{CheckpointPolicy, SearcherConfig, TrialConfig, load_config};
pub use context::TrialContext;
pub use distributed::{Collective, DistributedContext, SingleWorker, ThreadGroup};
pub use error::TrialError;
pub use metric_writer::{MetricWriter, TracingMetricWriter};
pub use preemption::{ExitRequest, FlagPreemption, NeverPreempt, PreemptionService, StopFileWatcher};
pub use rng::{EntropySource, RngState, RngStreams};
pub use searcher::{InMemoryScheduler, OperationSpec, SchedulerClient, SchedulerEvent, ValidationRecord};
pub use storage::{CheckpointEntry, CheckpointMetadata, CheckpointStorage, SharedFsStorage};
pub use training::{
    ControllerPhase, LaunchInfo, LoopOutcome, RunExit, RunSummary, TrialController, TrialServices,
};
pub use trial::{DataSource, GradScaler, LrScheduler, Model, Shard, StateDict, Stateful, StepMode, Trial, VecSource};
