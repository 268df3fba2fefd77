//! Training lengths in one of three units: epochs, batches or records.

use crate::error::TrialError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit in which the searcher expresses operation lengths and progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearcherUnit {
    Epochs,
    #[default]
    Batches,
    Records,
}

/// Discriminant of a [`TrainUnit`], used as a conversion target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Epoch,
    Batch,
    Record,
}

/// A length of training in exactly one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum TrainUnit {
    Epoch(u64),
    Batch(u64),
    Record(u64),
}

impl TrainUnit {
    pub fn from_searcher_unit(length: u64, unit: SearcherUnit) -> Self {
        match unit {
            SearcherUnit::Epochs => Self::Epoch(length),
            SearcherUnit::Batches => Self::Batch(length),
            SearcherUnit::Records => Self::Record(length),
        }
    }

    /// Build a length from a config-style triple; exactly one must be set.
    pub fn from_values(
        batches: Option<u64>,
        records: Option<u64>,
        epochs: Option<u64>,
    ) -> Result<Self, TrialError> {
        match (batches, records, epochs) {
            (Some(b), None, None) => Ok(Self::Batch(b)),
            (None, Some(r), None) => Ok(Self::Record(r)),
            (None, None, Some(e)) => Ok(Self::Epoch(e)),
            _ => Err(TrialError::config(format!(
                "invalid length: batches={batches:?} records={records:?} epochs={epochs:?}; \
                 exactly one must be set"
            ))),
        }
    }

    pub fn value(&self) -> u64 {
        match *self {
            Self::Epoch(v) | Self::Batch(v) | Self::Record(v) => v,
        }
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            Self::Epoch(_) => UnitKind::Epoch,
            Self::Batch(_) => UnitKind::Batch,
            Self::Record(_) => UnitKind::Record,
        }
    }

    /// Number of batches this length spans.
    ///
    /// Record lengths that do not divide evenly round down.
    pub fn to_batches(&self, epoch_len: u64, global_batch_size: u64) -> u64 {
        match *self {
            Self::Batch(b) => b,
            Self::Epoch(e) => e.saturating_mul(epoch_len),
            Self::Record(r) => r / global_batch_size.max(1),
        }
    }

    /// Convert to another unit through the batch count (floor division).
    pub fn convert(&self, target: UnitKind, epoch_len: u64, global_batch_size: u64) -> Self {
        let batches = self.to_batches(epoch_len, global_batch_size);
        match target {
            UnitKind::Batch => Self::Batch(batches),
            UnitKind::Epoch => Self::Epoch(batches / epoch_len.max(1)),
            UnitKind::Record => Self::Record(batches.saturating_mul(global_batch_size)),
        }
    }
}

impl fmt::Display for TrainUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Epoch(v) => write!(f, "{v} epochs"),
            Self::Batch(v) => write!(f, "{v} batches"),
            Self::Record(v) => write!(f, "{v} records"),
        }
    }
}

/// Config-file form of a length: `{ batches = 100 }`, `{ epochs = 2 }`, ...
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batches: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epochs: Option<u64>,
}

impl LengthSpec {
    pub fn batches(n: u64) -> Self {
        Self {
            batches: Some(n),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_none() && self.records.is_none() && self.epochs.is_none()
    }

    /// `None` when nothing is set, an error when more than one unit is set.
    pub fn to_train_unit(&self) -> Result<Option<TrainUnit>, TrialError> {
        if self.is_empty() {
            return Ok(None);
        }
        TrainUnit::from_values(self.batches, self.records, self.epochs).map(Some)
    }
}
