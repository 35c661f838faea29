//! Multi-head scaled dot-product attention for latent diffusion transformers.
//!
//! The crate defines one [`AttentionEngine`] contract with two backends:
//!
//! * [`reference::DenseAttention`]: the reference dense-softmax path. It
//!   supports boolean key masking and Q/K/V injection, the mechanism that
//!   splices pre-computed attention inputs from another generation pass into
//!   the current one for attention-based image editing.
//! * [`fused::MemoryEfficientAttention`]: a key-block streaming backend that
//!   never materialises the full similarity matrix. It supports neither
//!   masking nor injection and declares so via the engine capabilities;
//!   outputs match the dense path within floating-point tolerance.
//!
//! Inputs are `[batch, tokens, query_dim]` with an optional external context
//! `[batch, context_tokens, context_dim]`; when no context is given the
//! engines fall back to self-attention. Similarity scores are upcast to
//! `f32` under the default [`SimilarityPrecision::ForceF32`] policy.
//!
//! [`SimilarityPrecision::ForceF32`]: layers::SimilarityPrecision::ForceF32

pub mod core;
pub mod fused;
pub mod injection;
pub mod masks;
pub mod reference;

pub use self::core::{
    AttentionEngine, AttentionError, AttentionObserver, AttentionSnapshot, EngineConfig,
    RecordingObserver,
};
pub use fused::MemoryEfficientAttention;
pub use injection::{InjectedQkv, InjectionArgs, InjectionConfig};
pub use reference::DenseAttention;
