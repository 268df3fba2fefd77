//! Random number streams owned by a trial.
//!
//! The host stream is a seeded `ChaCha8Rng` the controller can capture and
//! restore exactly. Libraries and accelerators plug in further named streams
//! through [`EntropySource`].

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::TrialError;

/// A named random stream whose state can be captured.
pub trait EntropySource: Send {
    fn name(&self) -> &str;

    /// Accelerator streams are optional on restore: a checkpoint taken on a
    /// machine without one restores with a warning.
    fn is_accelerator(&self) -> bool {
        false
    }

    fn seed(&mut self, seed: u64);
    fn state(&self) -> Result<Value, TrialError>;
    fn set_state(&mut self, state: Value) -> Result<(), TrialError>;
}

/// Position of the host stream: key, stream id and the number of 32-bit
/// words already consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRngState {
    pub seed: [u8; 32],
    pub stream: u64,
    pub word_pos: u64,
}

impl HostRngState {
    fn capture(rng: &ChaCha8Rng) -> Result<Self, TrialError> {
        let word_pos = u64::try_from(rng.get_word_pos())
            .map_err(|_| TrialError::checkpoint_format("host RNG position does not fit in 64 bits"))?;
        Ok(Self {
            seed: rng.get_seed(),
            stream: rng.get_stream(),
            word_pos,
        })
    }

    fn to_rng(self) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        rng.set_stream(self.stream);
        rng.set_word_pos(u128::from(self.word_pos));
        rng
    }
}

/// Captured state of every stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RngState {
    pub host: HostRngState,
    #[serde(default)]
    pub streams: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accelerator: BTreeMap<String, Value>,
}

pub struct RngStreams {
    host: ChaCha8Rng,
    sources: Vec<Box<dyn EntropySource>>,
}

impl std::fmt::Debug for RngStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RngStreams")
            .field("sources", &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl RngStreams {
    pub fn new(seed: u64) -> Self {
        Self {
            host: ChaCha8Rng::seed_from_u64(seed),
            sources: Vec::new(),
        }
    }

    pub fn register(&mut self, source: Box<dyn EntropySource>) {
        self.sources.push(source);
    }

    pub fn host(&mut self) -> &mut ChaCha8Rng {
        &mut self.host
    }

    pub fn has_accelerator(&self) -> bool {
        self.sources.iter().any(|s| s.is_accelerator())
    }

    /// Reseed the host stream and every registered source.
    pub fn seed_all(&mut self, seed: u64) {
        self.host = ChaCha8Rng::seed_from_u64(seed);
        for source in &mut self.sources {
            source.seed(seed);
        }
    }

    pub fn capture(&self) -> Result<RngState, TrialError> {
        let mut streams = BTreeMap::new();
        let mut accelerator = BTreeMap::new();
        for source in &self.sources {
            let target = if source.is_accelerator() {
                &mut accelerator
            } else {
                &mut streams
            };
            target.insert(source.name().to_string(), source.state()?);
        }
        Ok(RngState {
            host: HostRngState::capture(&self.host)?,
            streams,
            accelerator,
        })
    }

    /// Restore from a captured state. Missing library streams and accelerator
    /// mismatches warn instead of failing.
    pub fn restore(&mut self, state: RngState) -> Result<(), TrialError> {
        let RngState {
            host,
            mut streams,
            mut accelerator,
        } = state;
        self.host = host.to_rng();

        let has_accelerator = self.has_accelerator();
        if has_accelerator && accelerator.is_empty() {
            tracing::warn!(
                "checkpoint has no accelerator RNG state; accelerator streams keep their current state"
            );
        } else if !has_accelerator && !accelerator.is_empty() {
            tracing::warn!(
                streams = ?accelerator.keys().collect::<Vec<_>>(),
                "checkpoint has accelerator RNG state but this machine has no accelerator; ignoring it"
            );
        }

        for source in &mut self.sources {
            let saved = if source.is_accelerator() {
                accelerator.remove(source.name())
            } else {
                streams.remove(source.name())
            };
            match saved {
                Some(value) => source.set_state(value)?,
                None if !source.is_accelerator() => {
                    tracing::warn!(stream = source.name(), "no saved RNG state for stream");
                }
                None => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    struct Counter {
        name: &'static str,
        value: u64,
        accelerator: bool,
    }

    impl EntropySource for Counter {
        fn name(&self) -> &str {
            self.name
        }
        fn is_accelerator(&self) -> bool {
            self.accelerator
        }
        fn seed(&mut self, seed: u64) {
            self.value = seed;
        }
        fn state(&self) -> Result<Value, TrialError> {
            Ok(Value::from(self.value))
        }
        fn set_state(&mut self, state: Value) -> Result<(), TrialError> {
            self.value = state
                .as_u64()
                .ok_or_else(|| TrialError::checkpoint_format("counter state must be an integer"))?;
            Ok(())
        }
    }

    #[test]
    fn test_capture_restore_resumes_host_sequence() {
        let mut rng = RngStreams::new(7);
        let _: u64 = rng.host().r#gen();
        let state = rng.capture().unwrap();
        let expected: Vec<u64> = (0..4).map(|_| rng.host().r#gen()).collect();

        let mut restored = RngStreams::new(0);
        restored.restore(state).unwrap();
        let actual: Vec<u64> = (0..4).map(|_| restored.host().r#gen()).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_state_survives_json() {
        let rng = RngStreams::new(11);
        let json = serde_json::to_string(&rng.capture().unwrap()).unwrap();
        let back: RngState = serde_json::from_str(&json).unwrap();
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }

    #[test]
    fn test_named_streams_restored_and_accelerator_mismatch_tolerated() {
        let mut saved = RngStreams::new(1);
        saved.register(Box::new(Counter {
            name: "numeric",
            value: 0,
            accelerator: false,
        }));
        saved.register(Box::new(Counter {
            name: "gpu",
            value: 0,
            accelerator: true,
        }));
        saved.seed_all(99);
        let state = saved.capture().unwrap();
        assert_eq!(state.accelerator.get("gpu"), Some(&Value::from(99u64)));

        let mut cpu_only = RngStreams::new(1);
        cpu_only.register(Box::new(Counter {
            name: "numeric",
            value: 0,
            accelerator: false,
        }));
        cpu_only.restore(state).unwrap();
        assert_eq!(
            cpu_only.capture().unwrap().streams.get("numeric"),
            Some(&Value::from(99u64))
        );
    }
}
