//! Core contract shared by the attention engines.
//!
//! Engines consume sequence tensors `[batch, tokens, query_dim]` plus an
//! optional context `[batch, context_tokens, context_dim]` and return
//! `[batch, tokens, query_dim]`. Backend capabilities (masking, injection)
//! are declared on the trait rather than discovered at call time, so a
//! deployment can pick a backend statically and trust the contract.

pub mod config;
pub mod errors;
pub mod observer;

use candle_core::Tensor;

pub use config::EngineConfig;
pub use errors::AttentionError;
pub use observer::{AttentionObserver, AttentionSnapshot, RecordingObserver};

use crate::injection::InjectionArgs;

/// Unified interface over the dense and memory-efficient backends.
pub trait AttentionEngine: Send + Sync {
    /// Computes multi-head attention.
    ///
    /// * `x`: query input `[batch, tokens, query_dim]`.
    /// * `context`: key/value source `[batch, context_tokens, context_dim]`;
    ///   `None` falls back to self-attention over `x`.
    /// * `mask`: boolean key mask `[batch, context_tokens]` (dtype `U8`,
    ///   non-zero = attend). Only the dense backend accepts one.
    /// * `injection`: externally supplied Q/K/V with a mixing schedule.
    ///   Only the dense backend accepts it.
    fn forward(
        &self,
        x: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        injection: Option<InjectionArgs<'_>>,
    ) -> Result<Tensor, AttentionError>;

    /// Whether this backend honours a key mask.
    fn supports_mask(&self) -> bool;

    /// Whether this backend honours injected Q/K/V.
    fn supports_injection(&self) -> bool;

    /// Static configuration of this engine instance.
    fn config(&self) -> &EngineConfig;
}
