//! Subcommand handlers.

use crate::demo::LinearRegressionTrial;
use crate::{CheckpointAction, Commands, ConfigAction};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use trialrun_core::preemption::PreemptionService;
use trialrun_core::{
    DistributedContext, InMemoryScheduler, LaunchInfo, NeverPreempt, RunExit, RunSummary,
    SharedFsStorage, StopFileWatcher, ThreadGroup, TrialConfig, TrialController, TrialError,
    TrialServices, load_config,
};

#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Trial id recorded in checkpoints
    #[arg(long, default_value_t = 1)]
    pub trial_id: u64,

    /// Searcher operation lengths in searcher units, e.g. 100,200
    #[arg(long, value_delimiter = ',')]
    pub operations: Vec<u64>,

    /// Train for this many batches when no operations are given
    #[arg(long)]
    pub max_batches: Option<u64>,

    /// Number of in-process workers
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Resume from a checkpoint id, or "latest"
    #[arg(long)]
    pub resume: Option<String>,

    /// Override a config value, e.g. --set hyperparameters.learning_rate=0.1
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Preempt with a checkpoint once this file exists
    #[arg(long)]
    pub stop_file: Option<PathBuf>,
}

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => {
            let summary = handle_run(&args, workspace)?;
            print_summary(&summary);
            Ok(())
        }
        Commands::Checkpoints { action } => handle_checkpoints(action, workspace),
        Commands::Config { action } => handle_config(action, workspace),
    }
}

/// Split `key=value`; the value is read as JSON when it parses, otherwise
/// taken as a string.
pub fn parse_override(raw: &str) -> anyhow::Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Override '{}' is not of the form KEY=VALUE", raw))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Override '{}' has an empty key", raw);
    }
    let value = serde_json::from_str(value.trim()).unwrap_or_else(|_| json!(value.trim()));
    Ok((key.to_string(), value))
}

fn load_workspace_config(workspace: &Path, overrides: &[(String, Value)]) -> anyhow::Result<TrialConfig> {
    let mut config = load_config(Some(workspace), overrides)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    if config.checkpoint_storage.is_relative() {
        config.checkpoint_storage = workspace.join(&config.checkpoint_storage);
    }
    Ok(config)
}

/// Fill in demo hyperparameters the user left unset.
fn with_demo_defaults(hparams: &Value) -> Value {
    let mut merged = json!({
        "learning_rate": 0.05,
        "momentum": 0.9,
        "features": 3,
        "lr_step_epochs": 2,
        "lr_gamma": 0.5,
        "train_batches": 16,
        "validation_batches": 4,
    });
    if let (Some(target), Some(source)) = (merged.as_object_mut(), hparams.as_object()) {
        for (k, v) in source {
            target.insert(k.clone(), v.clone());
        }
    }
    merged
}

pub fn handle_run(args: &RunArgs, workspace: &Path) -> anyhow::Result<RunSummary> {
    let mut overrides = args
        .overrides
        .iter()
        .map(|raw| parse_override(raw))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if let Some(max) = args.max_batches {
        overrides.push(("max_length.batches".to_string(), json!(max)));
    }
    let mut config = load_workspace_config(workspace, &overrides)?;
    config.hyperparameters = with_demo_defaults(&config.hyperparameters);

    let storage = SharedFsStorage::new(&config.checkpoint_storage);
    let latest_checkpoint = match args.resume.as_deref() {
        None => None,
        Some("latest") => Some(
            storage
                .latest()?
                .ok_or_else(|| anyhow::anyhow!("No checkpoints in {}", storage.base_dir().display()))?
                .storage_id,
        ),
        Some(id) => Some(id.to_string()),
    };
    let launch = LaunchInfo {
        trial_id: args.trial_id,
        latest_checkpoint,
    };
    let scheduler = (!args.operations.is_empty()).then(|| {
        InMemoryScheduler::new(
            config.searcher.unit,
            args.operations.iter().copied(),
            config.searcher.metric.clone(),
            config.searcher.smaller_is_better,
        )
    });

    tracing::info!(
        trial_id = args.trial_id,
        workers = args.workers,
        storage = %config.checkpoint_storage.display(),
        resume = ?launch.latest_checkpoint,
        "starting trial"
    );

    let worker = WorkerSetup {
        config,
        launch,
        scheduler: scheduler.clone(),
        stop_file: args.stop_file.clone(),
    };
    let summary = if args.workers <= 1 {
        worker.run(DistributedContext::single())?
    } else {
        run_group(args.workers, worker)?
    };

    if let Some(scheduler) = scheduler {
        for (op_id, metric) in scheduler.completions() {
            tracing::info!(op_id, searcher_metric = metric, "operation completed");
        }
    }
    Ok(summary)
}

/// Everything a worker thread needs to build its own controller.
#[derive(Clone)]
struct WorkerSetup {
    config: TrialConfig,
    launch: LaunchInfo,
    scheduler: Option<InMemoryScheduler>,
    stop_file: Option<PathBuf>,
}

impl WorkerSetup {
    fn run(self, dist: DistributedContext) -> Result<RunSummary, TrialError> {
        let trial =
            LinearRegressionTrial::from_hparams(&self.config.hyperparameters, &self.config.searcher.metric)?;
        let preemption: Box<dyn PreemptionService> = match self.stop_file {
            Some(path) => Box::new(StopFileWatcher::new(path, true)),
            None => Box::new(NeverPreempt),
        };
        let mut services =
            TrialServices::local(Box::new(SharedFsStorage::new(&self.config.checkpoint_storage)))
                .with_preemption(preemption);
        if let Some(scheduler) = self.scheduler {
            services = services.with_scheduler(Box::new(scheduler));
        }
        let mut controller = TrialController::new(trial, self.config, self.launch, services, dist)?;
        controller.run()
    }
}

/// Run one worker per thread and return the chief's summary.
fn run_group(size: usize, worker: WorkerSetup) -> anyhow::Result<RunSummary> {
    let handles: Vec<_> = ThreadGroup::new(size)
        .into_iter()
        .enumerate()
        .map(|(rank, member)| {
            let worker = worker.clone();
            std::thread::Builder::new()
                .name(format!("trialrun-worker-{}", rank))
                .spawn(move || worker.run(DistributedContext::new(Arc::new(member))))
        })
        .collect::<Result<_, _>>()?;

    let mut results = Vec::with_capacity(size);
    for (rank, handle) in handles.into_iter().enumerate() {
        let result = handle
            .join()
            .map_err(|_| anyhow::anyhow!("Worker {} panicked", rank))?;
        results.push(result);
    }
    let mut results = results.into_iter();
    match results.next() {
        Some(chief) => Ok(chief?),
        None => anyhow::bail!("No workers ran"),
    }
}

fn print_summary(summary: &RunSummary) {
    let exit = match summary.exit {
        RunExit::Completed => "completed",
        RunExit::Preempted => "preempted",
        RunExit::InvalidHyperparameters => "stopped: invalid hyperparameters",
    };
    println!("Trial {}", exit);
    println!("  batches trained:      {}", summary.batches_trained);
    println!("  epochs trained:       {}", summary.epochs_trained);
    println!("  operations completed: {}", summary.operations_completed);
    if let Some(id) = &summary.latest_checkpoint {
        println!("  latest checkpoint:    {}", id);
    }
    if let Some(metrics) = &summary.last_validation {
        for (name, value) in metrics {
            match value.as_scalar() {
                Some(v) => println!("  {}: {:.6}", name, v),
                None => println!("  {}: {:?}", name, value),
            }
        }
    }
}

fn handle_checkpoints(action: CheckpointAction, workspace: &Path) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace, &[])?;
    let storage = SharedFsStorage::new(&config.checkpoint_storage);
    match action {
        CheckpointAction::List => {
            let entries = storage.list()?;
            if entries.is_empty() {
                println!("No checkpoints in {}", storage.base_dir().display());
                return Ok(());
            }
            println!("Checkpoints ({}):", entries.len());
            for entry in entries {
                println!(
                    "  {}  steps={:<8} {:>10} bytes  {}",
                    entry.storage_id,
                    entry.steps_completed,
                    entry.size_bytes,
                    entry.created_at.to_rfc3339()
                );
            }
            Ok(())
        }
        CheckpointAction::Show { id } => {
            let id = resolve_checkpoint_id(&storage, &id)?;
            let metadata = storage
                .metadata(&id)?
                .ok_or_else(|| anyhow::anyhow!("Checkpoint {} has no metadata", id))?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            Ok(())
        }
    }
}

fn resolve_checkpoint_id(storage: &SharedFsStorage, id: &str) -> anyhow::Result<String> {
    if id != "latest" {
        return Ok(id.to_string());
    }
    Ok(storage
        .latest()?
        .ok_or_else(|| anyhow::anyhow!("No checkpoints in {}", storage.base_dir().display()))?
        .storage_id)
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".trialrun");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let default_config = TrialConfig {
                hyperparameters: with_demo_defaults(&json!({})),
                ..TrialConfig::default()
            };
            let toml_str = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), &[])
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
