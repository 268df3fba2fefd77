//! Trial configuration.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace `.trialrun/config.toml` -> `TRIALRUN_` environment -> explicit
//! overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::TrialError;
use crate::training::unit::{LengthSpec, SearcherUnit, TrainUnit};

/// When validations also produce a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// After every validation.
    All,
    /// After validations that improve on the best searcher metric.
    #[default]
    Best,
    /// Only on the checkpoint cadence.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherConfig {
    /// Validation metric the searcher optimizes.
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_true")]
    pub smaller_is_better: bool,
    /// Unit of operation lengths.
    #[serde(default)]
    pub unit: SearcherUnit,
}

impl Default for SearcherConfig {
    fn default() -> Self {
        Self {
            metric: default_metric(),
            smaller_is_better: true,
            unit: SearcherUnit::default(),
        }
    }
}

fn default_metric() -> String {
    "validation_loss".to_string()
}

fn default_true() -> bool {
    true
}

fn default_scheduling_unit() -> u64 {
    100
}

fn default_global_batch_size() -> u64 {
    32
}

fn default_one() -> u64 {
    1
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(".trialrun").join("checkpoints")
}

fn default_hyperparameters() -> Value {
    Value::Object(Default::default())
}

/// Everything the controller needs to know about one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialConfig {
    #[serde(default)]
    pub searcher: SearcherConfig,
    #[serde(default)]
    pub min_validation_period: LengthSpec,
    #[serde(default)]
    pub min_checkpoint_period: LengthSpec,
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,
    /// Average training metrics across workers before reporting.
    #[serde(default = "default_true")]
    pub average_training_metrics: bool,
    /// Batches between training metric reports.
    #[serde(default = "default_scheduling_unit")]
    pub scheduling_unit: u64,
    #[serde(default = "default_global_batch_size")]
    pub global_batch_size: u64,
    /// Batches per optimizer step.
    #[serde(default = "default_one")]
    pub aggregation_frequency: u64,
    /// Enable the mixed-precision gradient scaler.
    #[serde(default)]
    pub auto_amp: bool,
    #[serde(default)]
    pub seed: u64,
    /// Validate on one batch only.
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_storage_path")]
    pub checkpoint_storage: PathBuf,
    /// Training length when running without a searcher.
    #[serde(default)]
    pub max_length: LengthSpec,
    #[serde(default = "default_hyperparameters")]
    pub hyperparameters: Value,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            searcher: SearcherConfig::default(),
            min_validation_period: LengthSpec::default(),
            min_checkpoint_period: LengthSpec::default(),
            checkpoint_policy: CheckpointPolicy::default(),
            average_training_metrics: true,
            scheduling_unit: default_scheduling_unit(),
            global_batch_size: default_global_batch_size(),
            aggregation_frequency: 1,
            auto_amp: false,
            seed: 0,
            test_mode: false,
            debug: false,
            checkpoint_storage: default_storage_path(),
            max_length: LengthSpec::default(),
            hyperparameters: default_hyperparameters(),
        }
    }
}

impl TrialConfig {
    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> Result<(), TrialError> {
        self.min_validation_period
            .to_train_unit()
            .map_err(|e| TrialError::invalid_experiment(format!("min_validation_period: {e}")))?;
        self.min_checkpoint_period
            .to_train_unit()
            .map_err(|e| TrialError::invalid_experiment(format!("min_checkpoint_period: {e}")))?;
        self.max_length
            .to_train_unit()
            .map_err(|e| TrialError::invalid_experiment(format!("max_length: {e}")))?;
        if self.global_batch_size == 0 {
            return Err(TrialError::config("global_batch_size must be positive"));
        }
        if self.aggregation_frequency == 0 {
            return Err(TrialError::config("aggregation_frequency must be positive"));
        }
        if self.searcher.metric.is_empty() {
            return Err(TrialError::config("searcher.metric must not be empty"));
        }
        if !self.hyperparameters.is_object() {
            return Err(TrialError::config("hyperparameters must be a table"));
        }
        Ok(())
    }

    pub fn validation_period(&self) -> Result<Option<TrainUnit>, TrialError> {
        self.min_validation_period.to_train_unit()
    }

    pub fn checkpoint_period(&self) -> Result<Option<TrainUnit>, TrialError> {
        self.min_checkpoint_period.to_train_unit()
    }

    pub fn local_max_length(&self) -> Result<Option<TrainUnit>, TrialError> {
        self.max_length.to_train_unit()
    }
}

/// Load configuration with layered merging.
///
/// `overrides` are `(dotted.key, value)` pairs applied last, e.g.
/// `("searcher.metric", "accuracy")`.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: &[(String, Value)],
) -> Result<TrialConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(TrialConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "trialrun", "trialrun") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".trialrun").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // TRIALRUN_SEARCHER__METRIC, TRIALRUN_GLOBAL_BATCH_SIZE, ...
    figment = figment.merge(Env::prefixed("TRIALRUN_").split("__"));

    for (key, value) in overrides {
        figment = figment.merge(Serialized::default(key, value));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_validate() {
        let config = TrialConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scheduling_unit, 100);
        assert_eq!(config.checkpoint_policy, CheckpointPolicy::Best);
        assert!(config.validation_period().unwrap().is_none());
    }

    #[test]
    fn test_period_with_two_units_rejected() {
        let config = TrialConfig {
            min_validation_period: LengthSpec {
                batches: Some(5),
                epochs: Some(1),
                records: None,
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TrialError::InvalidExperiment(_))
        ));
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join(".trialrun");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(
            ws.join("config.toml"),
            r#"
checkpoint_policy = "all"
global_batch_size = 64

[searcher]
metric = "accuracy"
smaller_is_better = false
unit = "epochs"

[min_validation_period]
batches = 5

[hyperparameters]
learning_rate = 0.1
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), &[]).unwrap();
        assert_eq!(config.searcher.metric, "accuracy");
        assert_eq!(config.searcher.unit, SearcherUnit::Epochs);
        assert_eq!(config.checkpoint_policy, CheckpointPolicy::All);
        assert_eq!(config.min_validation_period, LengthSpec::batches(5));
        assert_eq!(config.hyperparameters["learning_rate"], json!(0.1));
        assert_eq!(config.scheduling_unit, 100);
    }

    #[test]
    fn test_load_config_overrides_win() {
        let overrides = vec![
            ("seed".to_string(), json!(7)),
            ("searcher.metric".to_string(), json!("loss")),
        ];
        let config = load_config(None, &overrides).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.searcher.metric, "loss");
    }
}
