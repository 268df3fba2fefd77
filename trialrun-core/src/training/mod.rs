//! Training loop: controller, cadence, metrics, callbacks and checkpoint bundles.

pub mod cadence;
pub mod callbacks;
pub mod checkpoint;
pub mod controller;
pub mod legacy;
pub mod metrics;
pub mod reducer;
pub mod state;
pub mod stream;
pub mod unit;

pub use callbacks::{
    AnomalyDetectionCallback, CallbackAction, CallbackSet, EarlyStoppingCallback, TrialCallback,
};
pub use checkpoint::{CheckpointBundle, LoadData};
pub use controller::{
    ControllerPhase, LaunchInfo, LoopOutcome, RunExit, RunSummary, TrialController, TrialServices,
};
pub use metrics::{EvaluationReducer, MetricValue, Metrics, Reducer, TrainingReport};
pub use state::TrialState;
pub use unit::{LengthSpec, SearcherUnit, TrainUnit, UnitKind};
