//! Preemption signals and trial status labels.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A request to leave the training loop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRequest {
    /// Take a checkpoint before exiting.
    pub checkpoint: bool,
}

/// Polled by the chief at every step boundary where the loop may stop.
pub trait PreemptionService: Send {
    fn should_preempt(&mut self) -> Option<ExitRequest>;

    /// Human-readable phase label such as `training` or `validating`.
    fn set_status(&mut self, _label: &str) {}
}

#[derive(Debug, Default, Clone)]
pub struct NeverPreempt;

impl PreemptionService for NeverPreempt {
    fn should_preempt(&mut self) -> Option<ExitRequest> {
        None
    }
}

/// Preemption driven by a shared flag, e.g. set from a signal handler.
#[derive(Debug, Clone)]
pub struct FlagPreemption {
    flag: Arc<AtomicBool>,
    checkpoint: bool,
    status: Option<String>,
}

impl FlagPreemption {
    pub fn new(checkpoint: bool) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            checkpoint,
            status: None,
        }
    }

    pub fn handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }
}

impl PreemptionService for FlagPreemption {
    fn should_preempt(&mut self) -> Option<ExitRequest> {
        self.flag.load(Ordering::SeqCst).then_some(ExitRequest {
            checkpoint: self.checkpoint,
        })
    }

    fn set_status(&mut self, label: &str) {
        self.status = Some(label.to_string());
    }
}

/// Preempts once a marker file appears. The file is left in place so every
/// later poll agrees.
#[derive(Debug, Clone)]
pub struct StopFileWatcher {
    path: PathBuf,
    checkpoint: bool,
}

impl StopFileWatcher {
    pub fn new(path: impl Into<PathBuf>, checkpoint: bool) -> Self {
        Self {
            path: path.into(),
            checkpoint,
        }
    }
}

impl PreemptionService for StopFileWatcher {
    fn should_preempt(&mut self) -> Option<ExitRequest> {
        if self.path.exists() {
            tracing::info!(path = %self.path.display(), "stop file found, preempting");
            Some(ExitRequest {
                checkpoint: self.checkpoint,
            })
        } else {
            None
        }
    }

    fn set_status(&mut self, label: &str) {
        tracing::debug!(status = label, "trial status");
    }
}
