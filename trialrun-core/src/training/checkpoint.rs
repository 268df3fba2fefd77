//! Checkpoint bundle format and on-disk layout.
//!
//! A checkpoint directory holds the bundle, the progress record and the
//! reconstruction metadata. Bundles written by older releases used other
//! file locations and single-object keys; readers probe every known layout,
//! newest first, and accept either key style but never both at once.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::TrialError;
use crate::persistence;
use crate::rng::RngState;
use crate::training::state::TrialState;
use crate::trial::StateDict;

pub const BUNDLE_FORMAT_VERSION: u32 = 2;
pub const FRAMEWORK: &str = "trialrun";

pub const BUNDLE_FILE: &str = "state_dict.json";
pub const PROGRESS_FILE: &str = "trial_state.json";
pub const LEGACY_PROGRESS_FILE: &str = "workload_sequencer.json";
pub const LOAD_DATA_FILE: &str = "load_data.json";

/// Bundle locations relative to the checkpoint directory, newest first.
pub const BUNDLE_LAYOUTS: &[&[&str]] = &[
    &[BUNDLE_FILE],
    &["trialrun", BUNDLE_FILE],
    &["legacy", BUNDLE_FILE],
    &["checkpoint.json"],
];

/// Key prefix added to parameters of data-parallel wrapped models.
pub const PARALLEL_PREFIX: &str = "module.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub format_version: u32,
    #[serde(default)]
    pub steps_completed: u64,
    #[serde(default = "default_framework")]
    pub framework: String,
}

fn default_framework() -> String {
    FRAMEWORK.to_string()
}

impl Default for BundleMetadata {
    fn default() -> Self {
        Self {
            format_version: 1,
            steps_completed: 0,
            framework: default_framework(),
        }
    }
}

/// Everything needed to resume training exactly.
///
/// Element `i` of each list belongs to the `i`-th object the trial exposes.
/// The `model_state_dict`, `optimizer_state_dict` and `lr_scheduler` keys
/// are the single-object format of older releases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_state_dict: Option<Vec<StateDict>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_state_dict: Option<StateDict>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizers_state_dict: Option<Vec<StateDict>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer_state_dict: Option<StateDict>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr_schedulers_state_dict: Option<Vec<StateDict>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr_scheduler: Option<StateDict>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaler_state_dict: Option<StateDict>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rng_state: Option<RngState>,

    #[serde(default)]
    pub callbacks: BTreeMap<String, Value>,

    #[serde(default)]
    pub metadata: BundleMetadata,

    /// Entries added by checkpoint save hooks.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// How many objects of each kind the live trial has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveCounts {
    pub models: usize,
    pub optimizers: usize,
    pub lr_schedulers: usize,
    pub has_scaler: bool,
}

impl CheckpointBundle {
    pub fn new(steps_completed: u64) -> Self {
        Self {
            metadata: BundleMetadata {
                format_version: BUNDLE_FORMAT_VERSION,
                steps_completed,
                framework: default_framework(),
            },
            ..Default::default()
        }
    }

    /// Check the whole bundle against the live trial. Nothing is loaded, so
    /// a failure here leaves every live object untouched.
    pub fn validate(&self, live: LiveCounts) -> Result<(), TrialError> {
        check_list(
            "model",
            self.models_state_dict.as_ref(),
            self.model_state_dict.as_ref(),
            live.models,
        )?;
        check_list(
            "optimizer",
            self.optimizers_state_dict.as_ref(),
            self.optimizer_state_dict.as_ref(),
            live.optimizers,
        )?;
        check_list(
            "lr scheduler",
            self.lr_schedulers_state_dict.as_ref(),
            self.lr_scheduler.as_ref(),
            live.lr_schedulers,
        )?;
        if self.scaler_state_dict.is_some() && !live.has_scaler {
            tracing::warn!("checkpoint has scaler state but the trial has no gradient scaler");
        }
        Ok(())
    }

    /// Model states in wrap order, whichever key style the bundle uses.
    pub fn model_states(&self) -> Vec<StateDict> {
        ordered(&self.models_state_dict, &self.model_state_dict)
    }

    pub fn optimizer_states(&self) -> Vec<StateDict> {
        ordered(&self.optimizers_state_dict, &self.optimizer_state_dict)
    }

    pub fn lr_scheduler_states(&self) -> Vec<StateDict> {
        ordered(&self.lr_schedulers_state_dict, &self.lr_scheduler)
    }

    pub fn is_legacy(&self) -> bool {
        self.model_state_dict.is_some()
            || self.optimizer_state_dict.is_some()
            || self.lr_scheduler.is_some()
    }
}

fn ordered(current: &Option<Vec<StateDict>>, legacy: &Option<StateDict>) -> Vec<StateDict> {
    match (current, legacy) {
        (Some(list), _) => list.clone(),
        (None, Some(single)) => vec![single.clone()],
        (None, None) => Vec::new(),
    }
}

fn check_list(
    kind: &str,
    current: Option<&Vec<StateDict>>,
    legacy: Option<&StateDict>,
    live: usize,
) -> Result<(), TrialError> {
    match (current, legacy) {
        (Some(_), Some(_)) => Err(TrialError::checkpoint_format(format!(
            "checkpoint carries both the single-{kind} and the {kind} list format"
        ))),
        (None, Some(_)) if live != 1 => Err(TrialError::checkpoint_format(format!(
            "a single-{kind} checkpoint cannot be loaded into a trial with {live} {kind}s"
        ))),
        (None, Some(_)) => Ok(()),
        (Some(list), None) if list.len() != live => {
            Err(TrialError::state_mismatch(format!("{kind} count"), live, list.len()))
        }
        (Some(_), None) => Ok(()),
        (None, None) if live > 0 => Err(TrialError::checkpoint_format(format!(
            "checkpoint has no {kind} state but the trial has {live} {kind}s"
        ))),
        (None, None) => Ok(()),
    }
}

/// True when every key carries the data-parallel prefix.
pub fn has_parallel_prefix(state: &StateDict) -> bool {
    !state.is_empty() && state.keys().all(|k| k.starts_with(PARALLEL_PREFIX))
}

pub fn add_parallel_prefix(state: StateDict) -> StateDict {
    state
        .into_iter()
        .map(|(k, v)| {
            if k.starts_with(PARALLEL_PREFIX) {
                (k, v)
            } else {
                (format!("{PARALLEL_PREFIX}{k}"), v)
            }
        })
        .collect()
}

pub fn strip_parallel_prefix(state: StateDict) -> StateDict {
    state
        .into_iter()
        .map(|(k, v)| match k.strip_prefix(PARALLEL_PREFIX) {
            Some(stripped) => (stripped.to_string(), v),
            None => (k, v),
        })
        .collect()
}

/// Adjust saved model keys to the way the live model is wrapped.
pub fn match_model_wrapping(state: StateDict, data_parallel: bool) -> StateDict {
    let prefixed = has_parallel_prefix(&state);
    match (data_parallel, prefixed) {
        (true, false) => {
            tracing::debug!("adding data-parallel prefix to saved model state");
            add_parallel_prefix(state)
        }
        (false, true) => {
            tracing::debug!("stripping data-parallel prefix from saved model state");
            strip_parallel_prefix(state)
        }
        _ => state,
    }
}

/// What is needed to rebuild the trial that wrote a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadData {
    pub trial_type: String,
    pub experiment_config: Value,
    pub hparams: Value,
    pub trialrun_version: String,
}

/// Write every file of a checkpoint into `dir`.
pub fn write_checkpoint(
    dir: &Path,
    bundle: &CheckpointBundle,
    state: &TrialState,
    load_data: &LoadData,
) -> Result<(), TrialError> {
    persistence::atomic_write_json(&dir.join(BUNDLE_FILE), bundle)?;
    persistence::atomic_write_json(&dir.join(PROGRESS_FILE), state)?;
    persistence::atomic_write_json(&dir.join(LOAD_DATA_FILE), load_data)?;
    Ok(())
}

/// Find the bundle in `dir`, trying each known layout in order.
///
/// Returns `None` when no layout matches. A file that exists but does not
/// parse is a format error, not a fallthrough to older layouts.
pub fn probe_bundle(dir: &Path) -> Result<Option<(PathBuf, CheckpointBundle)>, TrialError> {
    for layout in BUNDLE_LAYOUTS {
        let path = layout.iter().fold(dir.to_path_buf(), |p, seg| p.join(seg));
        if !path.is_file() {
            continue;
        }
        let raw: Value = persistence::load_json(&path)
            .map_err(|e| TrialError::checkpoint_format(format!("{}: {e}", path.display())))?
            .unwrap_or(Value::Null);
        if !raw.is_object() {
            return Err(TrialError::checkpoint_format(format!(
                "{} does not hold a mapping",
                path.display()
            )));
        }
        let bundle: CheckpointBundle = serde_json::from_value(raw)
            .map_err(|e| TrialError::checkpoint_format(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "found checkpoint bundle");
        return Ok(Some((path, bundle)));
    }
    Ok(None)
}

/// Read the progress record, falling back to the legacy file name.
pub fn read_progress(dir: &Path) -> Result<Option<TrialState>, TrialError> {
    for name in [PROGRESS_FILE, LEGACY_PROGRESS_FILE] {
        let path = dir.join(name);
        let loaded: Option<TrialState> = persistence::load_json(&path)
            .map_err(|e| TrialError::checkpoint_format(format!("{}: {e}", path.display())))?;
        if loaded.is_some() {
            return Ok(loaded);
        }
    }
    Ok(None)
}
