//! Adapters for callbacks written against older hook signatures.
//!
//! Older callbacks implemented epoch-start hooks without the epoch index.
//! Wrap them here once, at registration time; the controller only ever sees
//! the current [`TrialCallback`] signature.

use crate::training::callbacks::TrialCallback;

/// Wraps a zero-argument epoch-start hook.
pub struct ZeroArgEpochStart<F> {
    hook: F,
    warned: bool,
}

impl<F: FnMut() + Send> ZeroArgEpochStart<F> {
    pub fn new(hook: F) -> Self {
        Self { hook, warned: false }
    }
}

impl<F: FnMut() + Send> TrialCallback for ZeroArgEpochStart<F> {
    fn on_training_epoch_start(&mut self, _epoch_idx: u64) {
        if !self.warned {
            tracing::warn!(
                "on_training_epoch_start() without an epoch index is deprecated; \
                 implement TrialCallback::on_training_epoch_start directly"
            );
            self.warned = true;
        }
        (self.hook)();
    }
}
