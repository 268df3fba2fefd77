//! Error types for the trialrun-core crate.
//!
//! Only genuine failures live here. Preemption and invalid-hyperparameter
//! exits are not errors; they travel as `LoopOutcome` values through the
//! controller loop.

use thiserror::Error;

/// Top-level error type for trial execution.
#[derive(Debug, Error)]
pub enum TrialError {
    /// Missing wrapped objects, ambiguous evaluation methods, bad periods.
    #[error("Invalid experiment: {0}")]
    InvalidExperiment(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The model rejected its hyperparameters. Raised from user code and
    /// converted by the controller into an early exit.
    #[error("Invalid hyperparameters: {0}")]
    InvalidHyperparameters(String),

    #[error("Validation metric names must match across all batches: expected {expected:?}, found {found:?} at batch {batch_idx}")]
    MetricKeyMismatch {
        expected: Vec<String>,
        found: Vec<String>,
        batch_idx: usize,
    },

    #[error("{context} must return a mapping of metric names to numeric values, got {found}")]
    MetricsType { context: String, found: String },

    #[error("Searcher metric error: {0}")]
    SearcherMetric(String),

    #[error("Checkpoint format error: {0}")]
    CheckpointFormat(String),

    #[error("Checkpoint storage error: {0}")]
    Storage(String),

    #[error("State mismatch for {component}: expected {expected}, found {found}")]
    StateMismatch {
        component: String,
        expected: String,
        found: String,
    },

    #[error("Data error: {0}")]
    Data(String),

    #[error("Collective communication error: {0}")]
    Collective(String),

    /// A chief-only computation failed; non-chief workers observe this copy.
    #[error("Chief worker failed: {0}")]
    Chief(String),

    #[error("Searcher error: {0}")]
    Searcher(String),

    #[error("Callback '{name}' failed: {message}")]
    Callback { name: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TrialError {
    pub fn invalid_experiment(msg: impl Into<String>) -> Self {
        Self::InvalidExperiment(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_hp(msg: impl Into<String>) -> Self {
        Self::InvalidHyperparameters(msg.into())
    }

    pub fn checkpoint_format(msg: impl Into<String>) -> Self {
        Self::CheckpointFormat(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn collective(msg: impl Into<String>) -> Self {
        Self::Collective(msg.into())
    }

    pub fn searcher(msg: impl Into<String>) -> Self {
        Self::Searcher(msg.into())
    }

    pub fn state_mismatch(
        component: impl Into<String>,
        expected: impl ToString,
        found: impl ToString,
    ) -> Self {
        Self::StateMismatch {
            component: component.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// True for the hyperparameter rejection that maps to an early exit.
    pub fn is_invalid_hp(&self) -> bool {
        matches!(self, Self::InvalidHyperparameters(_))
    }
}
