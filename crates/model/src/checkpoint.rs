//! Recompute-eligible sublayer execution.
//!
//! Inference-only builds have no activation tape, so checkpointing is a
//! semantic no-op here: the wrapper exists to mark the recompute boundaries
//! a training integration would rebuild, and to keep call sites identical
//! between checkpointed and plain configurations.

use candle_core::{Result, Tensor};

/// Marks a closure as a recompute boundary.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    enabled: bool,
}

impl Checkpoint {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Runs the sublayer. Output is identical whether or not the boundary is
    /// enabled; the flag only changes what a future training pass may discard.
    pub fn run(&self, f: impl FnOnce() -> Result<Tensor>) -> Result<Tensor> {
        f()
    }
}
