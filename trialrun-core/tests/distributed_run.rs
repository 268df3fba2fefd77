//! Multi-worker runs over an in-process thread group.

mod common;

use common::{LinearTrial, config};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use trialrun_core::training::unit::{LengthSpec, SearcherUnit};
use trialrun_core::{
    CheckpointPolicy, DistributedContext, InMemoryScheduler, LaunchInfo, RunExit, RunSummary,
    SchedulerEvent, SharedFsStorage, ThreadGroup, TrialConfig, TrialController, TrialError,
    TrialServices,
};

/// Run one controller per worker; every worker is handed a scheduler
/// connection and the controller keeps only the chief's.
fn run_group(
    size: usize,
    config: TrialConfig,
    storage_dir: PathBuf,
    scheduler: &InMemoryScheduler,
    make_trial: impl Fn(usize) -> LinearTrial + Send + Sync + 'static,
) -> Vec<Result<(RunSummary, u64), TrialError>> {
    let make_trial = Arc::new(make_trial);
    let handles: Vec<_> = ThreadGroup::new(size)
        .into_iter()
        .map(|member| {
            let config = config.clone();
            let storage = SharedFsStorage::new(storage_dir.clone());
            let scheduler = scheduler.clone();
            let make_trial = Arc::clone(&make_trial);
            thread::spawn(move || -> Result<(RunSummary, u64), TrialError> {
                let dist = DistributedContext::new(Arc::new(member));
                let services =
                    TrialServices::local(Box::new(storage)).with_scheduler(Box::new(scheduler));
                let launch = LaunchInfo {
                    trial_id: 1,
                    latest_checkpoint: None,
                };
                let trial = make_trial(dist.rank());
                let mut c = TrialController::new(trial, config, launch, services, dist)?;
                let summary = c.run()?;
                Ok((summary, c.epoch_len()))
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_two_workers_train_in_lock_step() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = InMemoryScheduler::new(SearcherUnit::Batches, [6], "validation_loss", true);
    let config = TrialConfig {
        min_validation_period: LengthSpec::batches(3),
        min_checkpoint_period: LengthSpec::batches(3),
        checkpoint_policy: CheckpointPolicy::None,
        ..config(dir.path())
    };

    let results = run_group(2, config, dir.path().to_path_buf(), &scheduler, |_| {
        LinearTrial::new(1)
    });
    let results: Vec<(RunSummary, u64)> = results.into_iter().map(Result::unwrap).collect();

    for (summary, epoch_len) in &results {
        assert_eq!(summary.exit, RunExit::Completed);
        assert_eq!(summary.batches_trained, 6);
        // Eight training batches split over two shards.
        assert_eq!(*epoch_len, 4);
    }
    assert!(results[0].0.last_validation.is_some());
    assert!(results[1].0.last_validation.is_none());

    assert_eq!(scheduler.completions().len(), 1);
    let progress_reports = scheduler
        .events()
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::Progress { .. }))
        .count();
    assert_eq!(progress_reports, 6);

    let steps: Vec<u64> = SharedFsStorage::new(dir.path())
        .list()
        .unwrap()
        .into_iter()
        .map(|e| e.steps_completed)
        .collect();
    assert_eq!(steps, vec![3, 6]);
}

#[test]
fn test_metric_mismatch_across_workers_fails_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = InMemoryScheduler::new(SearcherUnit::Batches, [4], "validation_loss", true);
    let config = TrialConfig {
        min_validation_period: LengthSpec::batches(2),
        ..config(dir.path())
    };

    // Rank 1 reports an extra metric on its only validation batch.
    let results = run_group(2, config, dir.path().to_path_buf(), &scheduler, |rank| {
        let mut trial = LinearTrial::new(1);
        if rank == 1 {
            trial.mismatch_at = Some(0);
        }
        trial
    });

    assert!(matches!(results[0], Err(TrialError::MetricKeyMismatch { .. })));
    assert!(matches!(results[1], Err(TrialError::Collective(_))));
    assert!(scheduler.completions().is_empty());
}
