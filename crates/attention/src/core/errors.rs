//! Error types emitted by attention engines.

use thiserror::Error;

/// Attention-specific error category.
///
/// All variants represent programming or configuration errors; the compute
/// path is deterministic and nothing here is retryable.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes or engine configuration do not align with
    /// the documented contract.
    #[error("shape mismatch: {context}")]
    ShapeMismatch {
        /// Human-readable description of the offending tensor or field.
        context: String,
    },
    /// A mask was handed to a backend that does not implement masking.
    /// Masked calls must fail rather than silently drop the mask.
    #[error("the {backend} backend does not support key masking")]
    UnsupportedMask {
        /// Name of the rejecting backend.
        backend: &'static str,
    },
    /// Injection arguments were handed to a backend without injection
    /// support.
    #[error("the {backend} backend does not support q/k/v injection")]
    UnsupportedInjection {
        /// Name of the rejecting backend.
        backend: &'static str,
    },
    /// A failure propagated from the tensor substrate.
    #[error("tensor backend failure: {source}")]
    Backend {
        #[from]
        source: candle_core::Error,
    },
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
        }
    }
}
