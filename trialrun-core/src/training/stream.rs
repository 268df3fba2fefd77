//! Endless training stream over a finite data source.

use crate::error::TrialError;
use crate::trial::{DataSource, Shard};

/// Repeats a data source pass after pass. Epoch boundaries come from the
/// batch counter, not from the iterator.
pub struct TrainingStream<B> {
    source: Box<dyn DataSource<B>>,
    shard: Shard,
    iter: Option<Box<dyn Iterator<Item = B> + Send>>,
}

impl<B> TrainingStream<B> {
    pub fn new(source: Box<dyn DataSource<B>>, shard: Shard) -> Self {
        Self {
            source,
            shard,
            iter: None,
        }
    }

    /// Position the stream so the next batch follows the `batches_trained`
    /// already consumed. With an unknown epoch length the whole count is
    /// skipped.
    pub fn seek(&mut self, batches_trained: u64, epoch_len: u64) {
        let skip = if epoch_len == u64::MAX {
            batches_trained
        } else {
            batches_trained % epoch_len.max(1)
        };
        self.iter = Some(self.source.batches(skip as usize, self.shard));
    }

    pub fn next_batch(&mut self) -> Result<B, TrialError> {
        if let Some(batch) = self.iter.as_mut().and_then(|it| it.next()) {
            return Ok(batch);
        }
        let mut fresh = self.source.batches(0, self.shard);
        let batch = fresh
            .next()
            .ok_or_else(|| TrialError::data("training data produced no batches"))?;
        self.iter = Some(fresh);
        Ok(batch)
    }
}
