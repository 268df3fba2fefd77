//! Trial callbacks: lifecycle hooks, named state, and the built-in early
//! stopping and anomaly detection callbacks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::TrialError;
use crate::training::checkpoint::CheckpointBundle;
use crate::training::metrics::Metrics;

/// Action a callback can request from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    /// Equivalent to a local stop request: the trial exits at the next
    /// stop check and takes an exit checkpoint.
    Stop,
}

/// Hooks invoked at fixed points of the trial lifecycle.
///
/// Every hook has a no-op default. Hooks run on every worker; only
/// `on_checkpoint_save_start` and `on_checkpoint_write_end` are chief-only
/// because only the chief writes checkpoints.
pub trait TrialCallback: Send {
    fn on_trial_startup(&mut self, _first_batch_idx: u64, _latest_checkpoint: Option<&str>) {}

    /// Runs even when the trial fails.
    fn on_trial_shutdown(&mut self) {}

    fn on_training_start(&mut self) {}

    fn on_training_epoch_start(&mut self, _epoch_idx: u64) {}

    fn on_training_epoch_end(&mut self, _epoch_idx: u64) {}

    fn on_training_workload_end(&mut self, _avg_metrics: &Metrics, _batch_metrics: &[Metrics]) -> CallbackAction {
        CallbackAction::Continue
    }

    fn on_validation_start(&mut self) {}

    fn on_validation_epoch_start(&mut self) {}

    fn on_validation_epoch_end(&mut self, _batch_metrics: &[Metrics]) {}

    /// Whether `on_validation_end` needs real metrics on non-chief workers.
    /// When any callback says yes, reduced validation metrics are broadcast.
    fn observes_validation_end(&self) -> bool {
        false
    }

    fn on_validation_end(&mut self, _metrics: &Metrics) -> CallbackAction {
        CallbackAction::Continue
    }

    fn on_checkpoint_load_start(&mut self, _bundle: &CheckpointBundle) {}

    /// May add entries to the bundle or reject the hyperparameters with
    /// [`TrialError::InvalidHyperparameters`].
    fn on_checkpoint_save_start(&mut self, _bundle: &mut CheckpointBundle) -> Result<(), TrialError> {
        Ok(())
    }

    fn on_checkpoint_write_end(&mut self, _path: &Path) {}

    fn on_checkpoint_upload_end(&mut self, _storage_id: &str) {}

    /// Callbacks with persistent state return it here.
    fn state_dict(&self) -> Option<Value> {
        None
    }

    fn load_state_dict(&mut self, _state: Value) -> Result<(), TrialError> {
        Ok(())
    }
}

/// Named callbacks in registration order.
#[derive(Default)]
pub struct CallbackSet {
    callbacks: Vec<(String, Box<dyn TrialCallback>)>,
}

impl CallbackSet {
    pub fn new(callbacks: Vec<(String, Box<dyn TrialCallback>)>) -> Result<Self, TrialError> {
        let mut seen = std::collections::BTreeSet::new();
        for (name, _) in &callbacks {
            if !seen.insert(name.as_str()) {
                return Err(TrialError::invalid_experiment(format!(
                    "callback name '{name}' is registered twice; names key checkpointed state"
                )));
            }
        }
        Ok(Self { callbacks })
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.callbacks.iter().map(|(n, _)| n.as_str())
    }

    pub fn for_each(&mut self, mut f: impl FnMut(&mut dyn TrialCallback)) {
        for (_, cb) in &mut self.callbacks {
            f(cb.as_mut());
        }
    }

    /// Run a hook that can request a stop; any `Stop` wins.
    pub fn any_stop(&mut self, mut f: impl FnMut(&mut dyn TrialCallback) -> CallbackAction) -> bool {
        let mut stop = false;
        for (name, cb) in &mut self.callbacks {
            if f(cb.as_mut()) == CallbackAction::Stop {
                tracing::info!(callback = %name, "Callback requested the trial to stop");
                stop = true;
            }
        }
        stop
    }

    pub fn try_for_each(
        &mut self,
        mut f: impl FnMut(&mut dyn TrialCallback) -> Result<(), TrialError>,
    ) -> Result<(), TrialError> {
        for (name, cb) in &mut self.callbacks {
            f(cb.as_mut()).map_err(|e| match e {
                TrialError::InvalidHyperparameters(_) => e,
                other => TrialError::Callback {
                    name: name.clone(),
                    message: other.to_string(),
                },
            })?;
        }
        Ok(())
    }

    pub fn observes_validation_end(&self) -> bool {
        self.callbacks.iter().any(|(_, cb)| cb.observes_validation_end())
    }

    pub fn state_dicts(&self) -> BTreeMap<String, Value> {
        self.callbacks
            .iter()
            .filter_map(|(name, cb)| cb.state_dict().map(|s| (name.clone(), s)))
            .collect()
    }

    /// Restore each callback from its named entry; missing entries leave the
    /// callback freshly initialized.
    pub fn load_state_dicts(&mut self, states: &BTreeMap<String, Value>) -> Result<(), TrialError> {
        for (name, cb) in &mut self.callbacks {
            match states.get(name) {
                Some(state) => cb.load_state_dict(state.clone()).map_err(|e| TrialError::Callback {
                    name: name.clone(),
                    message: e.to_string(),
                })?,
                None if cb.state_dict().is_some() => {
                    tracing::warn!(
                        callback = %name,
                        "Callback has state but the checkpoint holds none under its name; \
                         it will be initialized from scratch"
                    );
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Stop after the searcher metric fails to improve for `patience`
/// consecutive validations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingCallback {
    pub metric: String,
    pub smaller_is_better: bool,
    pub patience: usize,
    pub min_delta: f64,
    counter: usize,
    best: Option<f64>,
}

impl EarlyStoppingCallback {
    pub fn new(metric: impl Into<String>, smaller_is_better: bool, patience: usize, min_delta: f64) -> Self {
        Self {
            metric: metric.into(),
            smaller_is_better,
            patience,
            min_delta,
            counter: 0,
            best: None,
        }
    }

    fn improves(&self, value: f64, best: f64) -> bool {
        if self.smaller_is_better {
            value < best - self.min_delta
        } else {
            value > best + self.min_delta
        }
    }

    pub fn observe(&mut self, value: f64) -> CallbackAction {
        match self.best {
            Some(best) if !self.improves(value, best) => {
                self.counter += 1;
                if self.counter >= self.patience {
                    CallbackAction::Stop
                } else {
                    CallbackAction::Continue
                }
            }
            _ => {
                self.best = Some(value);
                self.counter = 0;
                CallbackAction::Continue
            }
        }
    }
}

impl TrialCallback for EarlyStoppingCallback {
    fn observes_validation_end(&self) -> bool {
        true
    }

    fn on_validation_end(&mut self, metrics: &Metrics) -> CallbackAction {
        match metrics.get(&self.metric).and_then(|v| v.as_scalar()) {
            Some(value) => self.observe(value),
            None => CallbackAction::Continue,
        }
    }

    fn state_dict(&self) -> Option<Value> {
        serde_json::to_value(self).ok()
    }

    fn load_state_dict(&mut self, state: Value) -> Result<(), TrialError> {
        let restored: EarlyStoppingCallback = serde_json::from_value(state)?;
        self.counter = restored.counter;
        self.best = restored.best;
        Ok(())
    }
}

/// Stop on a non-finite training loss or a loss spike above `threshold`
/// times the recent mean.
#[derive(Debug, Clone)]
pub struct AnomalyDetectionCallback {
    pub metric: String,
    pub threshold: f64,
    window: Vec<f64>,
    window_size: usize,
}

impl AnomalyDetectionCallback {
    pub fn new(metric: impl Into<String>, threshold: f64, window_size: usize) -> Self {
        Self {
            metric: metric.into(),
            threshold,
            window: Vec::new(),
            window_size,
        }
    }

    pub fn observe(&mut self, loss: f64) -> CallbackAction {
        if !loss.is_finite() {
            return CallbackAction::Stop;
        }

        self.window.push(loss);
        if self.window.len() > self.window_size {
            self.window.remove(0);
        }

        if self.window.len() >= 3 {
            let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
            if loss > mean * self.threshold {
                return CallbackAction::Stop;
            }
        }

        CallbackAction::Continue
    }
}

impl TrialCallback for AnomalyDetectionCallback {
    fn on_training_workload_end(&mut self, avg_metrics: &Metrics, _batch_metrics: &[Metrics]) -> CallbackAction {
        match avg_metrics.get(&self.metric).and_then(|v| v.as_scalar()) {
            Some(loss) => self.observe(loss),
            None => CallbackAction::Continue,
        }
    }
}
