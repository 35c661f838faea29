//! Transformer blocks over spatial feature maps.
//!
//! The [`SpatialTransformer`] flattens a `[batch, channels, height, width]`
//! feature map into a token sequence, runs it through a stack of
//! [`TransformerBlock`]s (self-attention, cross-attention against an external
//! embedding sequence, feed-forward), and folds it back onto the grid with a
//! global residual. Its output projection is zero-initialised, so a freshly
//! constructed transformer is the identity and can be spliced into a
//! pretrained network without disturbing it.
//!
//! Q/K/V injection arguments are forwarded unchanged to every block's
//! self-attention, enabling attention-based image editing across generation
//! passes. [`GridSelfAttention`] is the single-head grid-form variant used in
//! purely convolutional contexts.

pub mod block;
pub mod checkpoint;
pub mod config;
pub mod grid;
pub mod spatial;

pub use block::TransformerBlock;
pub use checkpoint::Checkpoint;
pub use config::{AttentionBackend, SpatialTransformerConfig, TransformerBlockConfig};
pub use grid::GridSelfAttention;
pub use spatial::{flatten_grid, unflatten_grid, Conditioning, SpatialTransformer};
