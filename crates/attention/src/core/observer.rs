//! Observation hook for attention internals.
//!
//! The upstream design kept the last Q/K/V and attention-probability matrix
//! as mutable attributes on the module, silently overwritten every call.
//! Here that side channel is an explicit callback: engines that materialise
//! the probability matrix invoke the registered observer once per successful
//! forward, after softmax. A failed forward publishes nothing.

use std::sync::{Arc, Mutex};

use candle_core::Tensor;

/// Head-split internals of one attention call.
///
/// `q`, `k`, `v` are `[batch * heads, tokens, dim_head]`; `probs` is
/// `[batch * heads, q_tokens, k_tokens]`.
#[derive(Debug, Clone)]
pub struct AttentionSnapshot {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub probs: Tensor,
}

/// Receives attention internals for analysis or visualization tooling.
pub trait AttentionObserver: Send + Sync {
    /// Called once per successful forward on engines that materialise the
    /// attention probabilities.
    fn record(&self, snapshot: AttentionSnapshot);
}

/// Observer that retains the most recent snapshot behind a mutex.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    last: Mutex<Option<AttentionSnapshot>>,
}

impl RecordingObserver {
    /// Creates a shareable recording observer.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a clone of the last recorded snapshot, if any.
    pub fn last(&self) -> Option<AttentionSnapshot> {
        self.last.lock().ok().and_then(|guard| guard.clone())
    }

    /// Clears the retained snapshot.
    pub fn reset(&self) {
        if let Ok(mut guard) = self.last.lock() {
            *guard = None;
        }
    }
}

impl AttentionObserver for RecordingObserver {
    fn record(&self, snapshot: AttentionSnapshot) {
        if let Ok(mut guard) = self.last.lock() {
            *guard = Some(snapshot);
        }
    }
}
