//! Position-wise feed-forward sublayer with an optional gated projection.
//!
//! Operates on `(batch, tokens, channels)` tensors. The plain variant expands
//! the channel dimension by `mult`, applies GELU and contracts back. The
//! gated variant (GEGLU) fuses value and gate into a single double-width
//! projection, computing `value * gelu(gate)` before the contraction.

use candle_core::{DType, Device, Result, Tensor, D};

use crate::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

/// Configuration shared by both feed-forward variants.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    /// Incoming channel width.
    pub dim: usize,
    /// Outgoing channel width; defaults to `dim`.
    pub dim_out: Option<usize>,
    /// Expansion factor for the inner projection.
    pub mult: usize,
    /// Whether to use the gated (GEGLU) projection.
    pub gated: bool,
    /// Training-time dropout rate after the activation. Recorded for
    /// training integrations; the forward here runs in eval mode and never
    /// samples, so inference stays deterministic.
    pub dropout_p: Option<f32>,
}

impl FeedForwardConfig {
    /// Creates the default gated configuration with fourfold expansion.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            dim_out: None,
            mult: 4,
            gated: true,
            dropout_p: None,
        }
    }

    fn inner_dim(&self) -> usize {
        self.dim * self.mult
    }

    fn output_dim(&self) -> usize {
        self.dim_out.unwrap_or(self.dim)
    }
}

/// Feed-forward sublayer, plain GELU or GEGLU-gated.
#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    proj_in: Linear,
    proj_out: Linear,
}

impl FeedForward {
    /// Builds a feed-forward stack with freshly initialised projections.
    pub fn with_init(
        config: FeedForwardConfig,
        init: LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let in_width = if config.gated {
            config.inner_dim() * 2
        } else {
            config.inner_dim()
        };
        let proj_in = Linear::with_init(
            LinearConfig::new(config.dim, in_width),
            init,
            device,
            dtype,
        )?;
        let proj_out = Linear::with_init(
            LinearConfig::new(config.inner_dim(), config.output_dim()),
            init,
            device,
            dtype,
        )?;
        Ok(Self {
            config,
            proj_in,
            proj_out,
        })
    }

    /// Returns the configuration used at construction.
    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Runs the sublayer on a `(batch, tokens, channels)` tensor.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let projected = self.proj_in.forward(hidden, policy)?;
        let activated = if self.config.gated {
            let inner = self.config.inner_dim();
            let value = projected.narrow(D::Minus1, 0, inner)?;
            let gate = projected.narrow(D::Minus1, inner, inner)?;
            value.mul(&gate.gelu_erf()?)?
        } else {
            projected.gelu_erf()?
        };
        self.proj_out.forward(&activated, policy)
    }
}
