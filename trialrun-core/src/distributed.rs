//! Collective communication between SPMD workers.
//!
//! The transport is an external collaborator behind [`Collective`]; values
//! cross it as JSON. [`DistributedContext`] layers typed helpers on top,
//! including the chief-computed/broadcast primitive the controller uses for
//! every decision only rank 0 is allowed to make.
//!
//! Every worker must call the same collectives in the same order. A helper
//! that only the chief calls is a deadlock.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Barrier, Mutex};

use crate::error::TrialError;

/// Transport contract. Every call blocks until all workers have arrived.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// The chief passes `Some(value)`; every worker receives the chief's value.
    fn broadcast_value(&self, value: Option<Value>) -> Result<Value, TrialError>;

    /// Every worker receives all contributions ordered by rank.
    fn allgather_value(&self, value: Value) -> Result<Vec<Value>, TrialError>;

    /// Like `allgather_value` but only the chief receives the result.
    fn gather_value(&self, value: Value) -> Result<Option<Vec<Value>>, TrialError> {
        let all = self.allgather_value(value)?;
        Ok((self.rank() == 0).then_some(all))
    }
}

/// A world of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleWorker;

impl Collective for SingleWorker {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast_value(&self, value: Option<Value>) -> Result<Value, TrialError> {
        value.ok_or_else(|| TrialError::collective("chief broadcast without a value"))
    }

    fn allgather_value(&self, value: Value) -> Result<Vec<Value>, TrialError> {
        Ok(vec![value])
    }
}

struct Exchange {
    slots: Mutex<Vec<Option<Value>>>,
    barrier: Barrier,
}

/// In-process worker group: one member per thread, exchanging values through
/// shared slots fenced by a barrier.
pub struct ThreadGroup {
    rank: usize,
    size: usize,
    exchange: Arc<Exchange>,
}

impl ThreadGroup {
    /// Create `size` connected members, index = rank.
    pub fn new(size: usize) -> Vec<ThreadGroup> {
        let size = size.max(1);
        let exchange = Arc::new(Exchange {
            slots: Mutex::new(vec![None; size]),
            barrier: Barrier::new(size),
        });
        (0..size)
            .map(|rank| ThreadGroup {
                rank,
                size,
                exchange: Arc::clone(&exchange),
            })
            .collect()
    }

    fn slots(&self) -> Result<std::sync::MutexGuard<'_, Vec<Option<Value>>>, TrialError> {
        self.exchange
            .slots
            .lock()
            .map_err(|_| TrialError::collective("worker exchange poisoned by a panicked worker"))
    }

    /// Write, meet, read, meet. The second barrier keeps a fast worker from
    /// overwriting slots before slow ones have read them.
    fn exchange<R>(
        &self,
        write: Option<Value>,
        read: impl FnOnce(&[Option<Value>]) -> Result<R, TrialError>,
    ) -> Result<R, TrialError> {
        if let Some(v) = write {
            self.slots()?[self.rank] = Some(v);
        }
        self.exchange.barrier.wait();
        let result = {
            let slots = self.slots()?;
            read(&slots)
        };
        self.exchange.barrier.wait();
        if self.rank == 0 {
            // Clear after everyone has read so the next round starts empty.
            self.slots()?.iter_mut().for_each(|s| *s = None);
        }
        self.exchange.barrier.wait();
        result
    }
}

impl Collective for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_value(&self, value: Option<Value>) -> Result<Value, TrialError> {
        let write = if self.rank == 0 { value } else { None };
        self.exchange(write, |slots| {
            slots[0]
                .clone()
                .ok_or_else(|| TrialError::collective("chief broadcast without a value"))
        })
    }

    fn allgather_value(&self, value: Value) -> Result<Vec<Value>, TrialError> {
        self.exchange(Some(value), |slots| {
            slots
                .iter()
                .enumerate()
                .map(|(rank, s)| {
                    s.clone()
                        .ok_or_else(|| TrialError::collective(format!("rank {rank} sent nothing")))
                })
                .collect()
        })
    }
}

/// Typed collective helpers shared by every controller component.
#[derive(Clone)]
pub struct DistributedContext {
    inner: Arc<dyn Collective>,
}

impl std::fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .finish()
    }
}

impl Default for DistributedContext {
    fn default() -> Self {
        Self::single()
    }
}

impl DistributedContext {
    pub fn new(collective: Arc<dyn Collective>) -> Self {
        Self { inner: collective }
    }

    pub fn single() -> Self {
        Self::new(Arc::new(SingleWorker))
    }

    pub fn rank(&self) -> usize {
        self.inner.rank()
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn is_chief(&self) -> bool {
        self.rank() == 0
    }

    /// Every worker passes its own value; all receive the chief's.
    pub fn broadcast<T: Serialize + DeserializeOwned>(&self, value: T) -> Result<T, TrialError> {
        if self.size() == 1 {
            return Ok(value);
        }
        let payload = if self.is_chief() {
            Some(serde_json::to_value(&value)?)
        } else {
            None
        };
        let received = self.inner.broadcast_value(payload)?;
        Ok(serde_json::from_value(received)?)
    }

    pub fn allgather<T: Serialize + DeserializeOwned>(&self, value: T) -> Result<Vec<T>, TrialError> {
        if self.size() == 1 {
            return Ok(vec![value]);
        }
        let values = self.inner.allgather_value(serde_json::to_value(&value)?)?;
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(TrialError::from))
            .collect()
    }

    /// Gather to the chief; other workers get `None`.
    pub fn gather<T: Serialize + DeserializeOwned>(&self, value: T) -> Result<Option<Vec<T>>, TrialError> {
        if self.size() == 1 {
            return Ok(Some(vec![value]));
        }
        let gathered = self.inner.gather_value(serde_json::to_value(&value)?)?;
        gathered
            .map(|values| {
                values
                    .into_iter()
                    .map(|v| serde_json::from_value(v).map_err(TrialError::from))
                    .collect()
            })
            .transpose()
    }

    /// Agree on failure. If any worker holds an error, every worker returns
    /// one, so nobody walks into a collective the failed worker will skip.
    pub fn all_ok<T>(&self, local: Result<T, TrialError>) -> Result<T, TrialError> {
        if self.size() == 1 {
            return local;
        }
        let failure: Option<String> = local.as_ref().err().map(|e| e.to_string());
        let failures: Vec<Option<String>> = self.allgather(failure)?;
        let value = local?;
        match failures
            .into_iter()
            .enumerate()
            .find_map(|(rank, f)| f.map(|msg| (rank, msg)))
        {
            Some((rank, msg)) => Err(TrialError::collective(format!("rank {rank} failed: {msg}"))),
            None => Ok(value),
        }
    }

    /// Run `compute` on the chief only and hand its result to every worker.
    ///
    /// A chief-side error is broadcast too: the chief returns its original
    /// error and every other worker returns [`TrialError::Chief`], so nobody
    /// is left waiting at a collective the chief never reaches.
    pub fn chief_computed<T, F>(&self, compute: F) -> Result<T, TrialError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, TrialError>,
    {
        if self.size() == 1 {
            return compute();
        }
        if self.is_chief() {
            let local = compute();
            let shared: Result<&T, String> = local.as_ref().map_err(|e| e.to_string());
            let payload = serde_json::to_value(shared)?;
            self.inner.broadcast_value(Some(payload))?;
            local
        } else {
            let received = self.inner.broadcast_value(None)?;
            let shared: Result<T, String> = serde_json::from_value(received)?;
            shared.map_err(TrialError::Chief)
        }
    }
}
