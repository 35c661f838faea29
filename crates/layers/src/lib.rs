//! Building blocks shared by the attention engines and the spatial
//! transformer.
//!
//! The crate bundles bias-free projections, 1x1 channel-mixing convolutions,
//! group/layer normalization and the (optionally gated) feed-forward sublayer.
//! Everything is assembled from Candle primitives and follows the
//! `(batch, tokens, channels)` convention for sequence tensors and
//! `(batch, channels, height, width)` for grid tensors.

pub mod checks;
pub mod dtypes;
pub mod feed_forward;
pub mod linear;
pub mod norm;

pub use dtypes::{PrecisionPolicy, SimilarityPrecision};
pub use feed_forward::{FeedForward, FeedForwardConfig};
pub use linear::{Conv1x1, Linear, LinearConfig, LinearInit};
pub use norm::{GroupNorm, GroupNormConfig, LayerNorm, LayerNormConfig};
