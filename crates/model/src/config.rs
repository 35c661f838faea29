//! Configuration for transformer blocks and the spatial transformer.

use candle_core::{Error, Result};
use layers::SimilarityPrecision;

/// Which attention implementation a deployment runs on. Selected statically
/// at construction; the memory-efficient backend declares that it supports
/// neither masking nor injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttentionBackend {
    /// Dense softmax attention with mask and injection support.
    #[default]
    Reference,
    /// Key-block streaming attention; faster and lighter, no mask/injection.
    MemoryEfficient,
}

/// Configuration of a single transformer block.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformerBlockConfig {
    /// Token channel width inside the block.
    pub dim: usize,
    /// Number of attention heads.
    pub n_heads: usize,
    /// Channel width per head.
    pub d_head: usize,
    /// Width of the external conditioning sequence, if any.
    pub context_dim: Option<usize>,
    /// Training-time dropout rate for attention outputs and the
    /// feed-forward; inference forwards never sample.
    pub dropout_p: Option<f32>,
    /// Use the gated (GEGLU) feed-forward variant.
    pub gated_ff: bool,
    /// Route the external context into the first attention as well, turning
    /// it from self- into cross-attention.
    pub disable_self_attn: bool,
    /// Mark sublayers as recompute-eligible for gradient checkpointing.
    pub checkpoint: bool,
    /// Attention backend for both sublayers.
    pub backend: AttentionBackend,
    /// Upcast policy for similarity scores.
    pub precision: SimilarityPrecision,
}

impl TransformerBlockConfig {
    /// Creates a block configuration with the common defaults: gated
    /// feed-forward, checkpointing on, reference backend.
    pub fn new(dim: usize, n_heads: usize, d_head: usize) -> Self {
        Self {
            dim,
            n_heads,
            d_head,
            context_dim: None,
            dropout_p: None,
            gated_ff: true,
            disable_self_attn: false,
            checkpoint: true,
            backend: AttentionBackend::default(),
            precision: SimilarityPrecision::default(),
        }
    }
}

/// Configuration of the spatial transformer wrapper.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialTransformerConfig {
    /// Channel count of the incoming feature map.
    pub in_channels: usize,
    /// Number of attention heads.
    pub n_heads: usize,
    /// Channel width per head; `n_heads * d_head` is the working width.
    pub d_head: usize,
    /// Number of stacked transformer blocks.
    pub depth: usize,
    /// Conditioning widths: one entry broadcasts to all blocks, `depth`
    /// entries configure each block individually, `None` means
    /// self-attention only.
    pub context_dims: Option<Vec<usize>>,
    /// Turn every block's first attention into cross-attention.
    pub disable_self_attn: bool,
    /// Project in/out with linear maps on the token sequence instead of 1x1
    /// convolutions on the grid.
    pub use_linear_projection: bool,
    /// Mark block sublayers as recompute-eligible.
    pub use_checkpoint: bool,
    /// Training-time dropout rate threaded into the blocks; inference
    /// forwards never sample.
    pub dropout_p: Option<f32>,
    /// Use the gated feed-forward variant in the blocks.
    pub gated_ff: bool,
    /// Attention backend for all blocks.
    pub backend: AttentionBackend,
    /// Upcast policy for similarity scores.
    pub precision: SimilarityPrecision,
}

impl SpatialTransformerConfig {
    /// Creates a depth-1 configuration with convolutional projections.
    pub fn new(in_channels: usize, n_heads: usize, d_head: usize) -> Self {
        Self {
            in_channels,
            n_heads,
            d_head,
            depth: 1,
            context_dims: None,
            disable_self_attn: false,
            use_linear_projection: false,
            use_checkpoint: true,
            dropout_p: None,
            gated_ff: true,
            backend: AttentionBackend::default(),
            precision: SimilarityPrecision::default(),
        }
    }

    /// Working token width, `n_heads * d_head`.
    pub fn inner_dim(&self) -> usize {
        self.n_heads * self.d_head
    }

    /// Validates the per-block conditioning widths against `depth`.
    pub fn validate(&self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::Msg("spatial transformer depth must be non-zero".into()));
        }
        if let Some(dims) = &self.context_dims {
            if dims.len() != 1 && dims.len() != self.depth {
                return Err(Error::Msg(format!(
                    "context_dims carries {} entries; expected 1 or depth ({})",
                    dims.len(),
                    self.depth
                )));
            }
        }
        Ok(())
    }

    /// Conditioning width for block `index`, after broadcast resolution.
    pub fn context_dim_for_block(&self, index: usize) -> Option<usize> {
        self.context_dims.as_ref().map(|dims| {
            if dims.len() == 1 {
                dims[0]
            } else {
                dims[index]
            }
        })
    }

    /// Derives the block configuration for block `index`.
    pub fn block_config(&self, index: usize) -> TransformerBlockConfig {
        TransformerBlockConfig {
            dim: self.inner_dim(),
            n_heads: self.n_heads,
            d_head: self.d_head,
            context_dim: self.context_dim_for_block(index),
            dropout_p: self.dropout_p,
            gated_ff: self.gated_ff,
            disable_self_attn: self.disable_self_attn,
            checkpoint: self.use_checkpoint,
            backend: self.backend,
            precision: self.precision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_context_dim_broadcasts() {
        let mut config = SpatialTransformerConfig::new(64, 2, 32);
        config.depth = 3;
        config.context_dims = Some(vec![768]);
        config.validate().unwrap();
        for index in 0..3 {
            assert_eq!(config.context_dim_for_block(index), Some(768));
        }
    }

    #[test]
    fn per_block_context_dims_resolve_by_ordinal() {
        let mut config = SpatialTransformerConfig::new(64, 2, 32);
        config.depth = 2;
        config.context_dims = Some(vec![768, 1024]);
        config.validate().unwrap();
        assert_eq!(config.context_dim_for_block(0), Some(768));
        assert_eq!(config.context_dim_for_block(1), Some(1024));
    }

    #[test]
    fn mismatched_context_dims_are_rejected() {
        let mut config = SpatialTransformerConfig::new(64, 2, 32);
        config.depth = 3;
        config.context_dims = Some(vec![768, 1024]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_depth_is_rejected() {
        let mut config = SpatialTransformerConfig::new(64, 2, 32);
        config.depth = 0;
        assert!(config.validate().is_err());
    }
}
