//! Cross-worker metric reduction.
//!
//! Two paths: per-batch averaging of training metrics (uniform batch sizes
//! across workers are assumed, there is no weighting) and per-metric
//! reducers for evaluation results. Both combine values with commutative
//! reductions only, so the result does not depend on worker order.

use std::collections::{BTreeMap, BTreeSet};

use crate::distributed::DistributedContext;
use crate::error::TrialError;
use crate::training::metrics::{self, EvaluationReducer, Metrics, Reducer};

/// Average each buffered training batch across workers.
///
/// Every worker receives the averaged list. Workers train in lock-step, so
/// they all hold the same number of buffered batches.
pub fn combine_and_average_training_metrics(
    dist: &DistributedContext,
    per_batch: &[Metrics],
) -> Result<Vec<Metrics>, TrialError> {
    let gathered: Vec<Vec<Metrics>> = dist.allgather(per_batch.to_vec())?;
    let n_batches = per_batch.len();
    if let Some((rank, other)) = gathered.iter().enumerate().find(|(_, m)| m.len() != n_batches) {
        return Err(TrialError::state_mismatch(
            format!("buffered training batches on rank {rank}"),
            n_batches,
            other.len(),
        ));
    }

    (0..n_batches)
        .map(|idx| {
            let column: Vec<Metrics> = gathered.iter().map(|worker| worker[idx].clone()).collect();
            let keys: BTreeSet<String> = column.iter().flat_map(|m| m.keys().cloned()).collect();
            let reducers: BTreeMap<String, Reducer> =
                keys.into_iter().map(|k| (k, Reducer::Avg)).collect();
            metrics::reduce_batches(&column, &reducers)
        })
        .collect()
}

/// Reduce per-batch validation metrics over all batches of all workers.
///
/// Every batch of every worker must carry the same metric names. Returns the
/// reduced mapping on the chief and `None` elsewhere; errors are raised on
/// the chief only.
pub fn reduce_validation_metrics(
    dist: &DistributedContext,
    batch_metrics: Vec<Metrics>,
    reducer: &EvaluationReducer,
) -> Result<Option<Metrics>, TrialError> {
    let Some(gathered) = dist.gather(batch_metrics)? else {
        return Ok(None);
    };
    let all: Vec<Metrics> = gathered.into_iter().flatten().collect();
    let keys = all.first().map(metrics::key_set).unwrap_or_default();
    if let Some((idx, m)) = all
        .iter()
        .enumerate()
        .find(|(_, m)| metrics::key_set(m) != keys)
    {
        return Err(TrialError::MetricKeyMismatch {
            expected: keys.into_iter().collect(),
            found: m.keys().cloned().collect(),
            batch_idx: idx,
        });
    }
    let reducers = reducer.resolve(&keys)?;
    metrics::reduce_batches(&all, &reducers).map(Some)
}

/// Sum `(examples, batches)` pairs from every worker onto the chief.
pub fn sum_input_counts(
    dist: &DistributedContext,
    counts: (u64, u64),
) -> Result<Option<(u64, u64)>, TrialError> {
    Ok(dist.gather(counts)?.map(|pairs| {
        pairs
            .into_iter()
            .fold((0, 0), |(i, b), (pi, pb)| (i + pi, b + pb))
    }))
}
