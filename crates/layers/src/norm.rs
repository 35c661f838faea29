//! Normalization layers for grid and token tensors.
//!
//! [`GroupNorm`] normalizes grid tensors `(batch, channels, height, width)`
//! over channel groups and is the entry normalization of the spatial
//! transformer and grid self-attention. [`LayerNorm`] handles token tensors
//! `(batch, tokens, channels)` and fronts every transformer sublayer.
//! Statistics are promoted to [`PrecisionPolicy::reduction`] before the
//! output is cast back to the storage dtype.

use candle_core::{DType, Device, Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for [`GroupNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupNormConfig {
    /// Number of channels being normalised.
    pub channels: usize,
    /// Number of channel groups.
    pub groups: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl GroupNormConfig {
    /// The fixed recipe used throughout the diffusion backbone: 32 groups,
    /// epsilon 1e-6, learned affine parameters.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            groups: 32,
            epsilon: 1e-6,
        }
    }
}

/// Group normalization with learned per-channel scale and shift.
#[derive(Debug, Clone)]
pub struct GroupNorm {
    config: GroupNormConfig,
    weight: Tensor,
    bias: Tensor,
}

impl GroupNorm {
    /// Constructs a group norm from pre-existing affine parameters, each
    /// shaped `[channels]`.
    pub fn new(config: GroupNormConfig, weight: Tensor, bias: Tensor) -> Result<Self> {
        if config.groups == 0 || config.channels % config.groups != 0 {
            return Err(Error::Msg(format!(
                "group norm requires channels ({}) divisible by groups ({})",
                config.channels, config.groups
            )));
        }
        checks::expect_shape("group_norm.weight", &weight, &[config.channels])?;
        checks::expect_shape("group_norm.bias", &bias, &[config.channels])?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Constructs a group norm with identity affine parameters (scale 1,
    /// shift 0).
    pub fn identity(config: GroupNormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Tensor::ones(config.channels, dtype, device)?;
        let bias = Tensor::zeros(config.channels, dtype, device)?;
        Self::new(config, weight, bias)
    }

    /// Returns the configuration so callers can check shape compatibility.
    pub fn config(&self) -> &GroupNormConfig {
        &self.config
    }

    /// Normalizes a `(batch, channels, height, width)` grid.
    pub fn forward(&self, grid: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_bchw("group_norm.input", grid, self.config.channels)?;
        let (batch, channels, height, width) = grid.dims4()?;
        let group_size = channels / self.config.groups;
        let elements = (group_size * height * width) as f64;

        let grouped = policy
            .cast_for_reduction(grid)?
            .reshape((batch, self.config.groups, group_size * height * width))?;
        let mean = (grouped.sum_keepdim(D::Minus1)? / elements)?;
        let centered = grouped.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / elements)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = centered
            .broadcast_div(&denom)?
            .reshape((batch, channels, height, width))?;

        let weight = self
            .weight
            .to_dtype(normalized.dtype())?
            .reshape((1, channels, 1, 1))?;
        let bias = self
            .bias
            .to_dtype(normalized.dtype())?
            .reshape((1, channels, 1, 1))?;
        let scaled = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        policy.cast_to_storage(&scaled)
    }
}

/// Configuration for [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct LayerNormConfig {
    /// Size of the channel dimension being normalised.
    pub channels: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl LayerNormConfig {
    /// Creates a configuration with the transformer-block default epsilon.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            epsilon: 1e-5,
        }
    }
}

/// Standard layer normalization with learned affine parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: LayerNormConfig,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    /// Constructs a layer norm from pre-existing affine parameters.
    pub fn new(config: LayerNormConfig, weight: Tensor, bias: Tensor) -> Result<Self> {
        checks::expect_shape("layer_norm.weight", &weight, &[config.channels])?;
        checks::expect_shape("layer_norm.bias", &bias, &[config.channels])?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Constructs a layer norm with identity affine parameters.
    pub fn identity(config: LayerNormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Tensor::ones(config.channels, dtype, device)?;
        let bias = Tensor::zeros(config.channels, dtype, device)?;
        Self::new(config, weight, bias)
    }

    /// Returns the configuration so callers can check shape compatibility.
    pub fn config(&self) -> &LayerNormConfig {
        &self.config
    }

    /// Normalizes a `(batch, tokens, channels)` sequence over the channel
    /// axis.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_tokens_channels("layer_norm.input", hidden, self.config.channels)?;
        let channels = self.config.channels as f64;

        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / channels)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / channels)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = centered.broadcast_div(&denom)?;

        let weight = self.weight.to_dtype(normalized.dtype())?;
        let bias = self.bias.to_dtype(normalized.dtype())?;
        let scaled = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        policy.cast_to_storage(&scaled)
    }
}
