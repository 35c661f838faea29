//! Spatial transformer: transformer blocks applied to image feature maps.
//!
//! Wraps a stack of [`TransformerBlock`]s between a grid/token conversion:
//! group-normalise the `[B, C, H, W]` input, project into the working width,
//! flatten the grid into `H * W` tokens, run the blocks, project back and add
//! the residual. The output projection starts at zero so a freshly built
//! transformer is the identity map.

use std::sync::{Arc, OnceLock};

use attention::{AttentionObserver, InjectionArgs};
use candle_core::{DType, Device, Error, Result, Tensor};
use layers::{
    checks, Conv1x1, GroupNorm, GroupNormConfig, Linear, LinearConfig, LinearInit,
    PrecisionPolicy,
};

use crate::block::TransformerBlock;
use crate::config::SpatialTransformerConfig;

/// Conditioning handed to the block stack.
#[derive(Debug, Clone)]
pub enum Conditioning {
    /// One sequence shared by every block.
    Single(Tensor),
    /// One sequence per block, in block order.
    PerBlock(Vec<Tensor>),
}

impl Conditioning {
    /// Resolves to one context reference per block.
    fn resolve(&self, depth: usize) -> Result<Vec<&Tensor>> {
        match self {
            Conditioning::Single(tensor) => Ok(vec![tensor; depth]),
            Conditioning::PerBlock(tensors) if tensors.len() == depth => {
                Ok(tensors.iter().collect())
            }
            Conditioning::PerBlock(tensors) => Err(Error::Msg(format!(
                "conditioning carries {} sequences for {} blocks",
                tensors.len(),
                depth
            ))),
        }
    }
}

/// In/out projection, convolutional on the grid or linear on the tokens.
#[derive(Debug)]
enum Projection {
    Conv(Conv1x1),
    Linear(Linear),
}

impl Projection {
    fn build(
        input_dim: usize,
        output_dim: usize,
        init: LinearInit,
        linear: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let config = LinearConfig::new(input_dim, output_dim);
        if linear {
            Ok(Self::Linear(Linear::with_init(config, init, device, dtype)?))
        } else {
            Ok(Self::Conv(Conv1x1::with_init(config, init, device, dtype)?))
        }
    }
}

pub struct SpatialTransformer {
    config: SpatialTransformerConfig,
    policy: PrecisionPolicy,
    norm: GroupNorm,
    proj_in: Projection,
    blocks: Vec<TransformerBlock>,
    proj_out: Projection,
    first_call: OnceLock<()>,
}

impl std::fmt::Debug for SpatialTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialTransformer")
            .field("config", &self.config)
            .finish()
    }
}

impl SpatialTransformer {
    pub fn new(config: SpatialTransformerConfig, device: &Device, dtype: DType) -> Result<Self> {
        Self::build(config, device, dtype, None)
    }

    /// Builds the transformer with `observer` attached to every block's
    /// first attention sublayer. Requires the reference backend.
    pub fn with_observer(
        config: SpatialTransformerConfig,
        device: &Device,
        dtype: DType,
        observer: Arc<dyn AttentionObserver>,
    ) -> Result<Self> {
        Self::build(config, device, dtype, Some(observer))
    }

    fn build(
        config: SpatialTransformerConfig,
        device: &Device,
        dtype: DType,
        observer: Option<Arc<dyn AttentionObserver>>,
    ) -> Result<Self> {
        config.validate()?;
        let inner = config.inner_dim();

        let norm = GroupNorm::identity(GroupNormConfig::new(config.in_channels), device, dtype)?;
        let proj_in = Projection::build(
            config.in_channels,
            inner,
            LinearInit::Uniform,
            config.use_linear_projection,
            device,
            dtype,
        )?;
        let proj_out = Projection::build(
            inner,
            config.in_channels,
            LinearInit::Zeros,
            config.use_linear_projection,
            device,
            dtype,
        )?;

        let mut blocks = Vec::with_capacity(config.depth);
        for index in 0..config.depth {
            let block_config = config.block_config(index);
            let block = match &observer {
                Some(observer) => TransformerBlock::with_observer(
                    block_config,
                    device,
                    dtype,
                    observer.clone(),
                )?,
                None => TransformerBlock::new(block_config, device, dtype)?,
            };
            blocks.push(block);
        }

        Ok(Self {
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            norm,
            proj_in,
            blocks,
            proj_out,
            first_call: OnceLock::new(),
            config,
        })
    }

    pub fn config(&self) -> &SpatialTransformerConfig {
        &self.config
    }

    /// Runs the transformer on a `[B, C, H, W]` feature map. `injection` is
    /// forwarded to every block's first attention sublayer.
    pub fn forward(
        &self,
        x: &Tensor,
        context: Option<&Conditioning>,
        injection: Option<InjectionArgs<'_>>,
    ) -> Result<Tensor> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "spatial_transformer init channels={} heads={} dim_head={} depth={} projection={}",
                self.config.in_channels,
                self.config.n_heads,
                self.config.d_head,
                self.config.depth,
                if self.config.use_linear_projection {
                    "linear"
                } else {
                    "conv"
                },
            );
        }

        checks::expect_bchw("spatial_transformer.input", x, self.config.in_channels)?;
        let (_, _, height, width) = x.dims4()?;

        let contexts: Vec<Option<&Tensor>> = match context {
            Some(conditioning) => conditioning
                .resolve(self.blocks.len())?
                .into_iter()
                .map(Some)
                .collect(),
            None => vec![None; self.blocks.len()],
        };

        let normed = self.norm.forward(x, &self.policy)?;
        let mut tokens = match &self.proj_in {
            Projection::Conv(conv) => flatten_grid(&conv.forward(&normed, &self.policy)?)?,
            Projection::Linear(linear) => {
                linear.forward(&flatten_grid(&normed)?, &self.policy)?
            }
        };

        for (block, block_context) in self.blocks.iter().zip(contexts) {
            tokens = block.forward(&tokens, block_context, injection)?;
        }

        let out = match &self.proj_out {
            Projection::Conv(conv) => {
                conv.forward(&unflatten_grid(&tokens, height, width)?, &self.policy)?
            }
            Projection::Linear(linear) => {
                unflatten_grid(&linear.forward(&tokens, &self.policy)?, height, width)?
            }
        };
        out + x
    }
}

/// `[B, C, H, W] -> [B, H * W, C]`; token `h * W + w` carries pixel `(h, w)`.
pub fn flatten_grid(grid: &Tensor) -> Result<Tensor> {
    let (batch, channels, height, width) = grid.dims4()?;
    grid.reshape((batch, channels, height * width))?
        .transpose(1, 2)?
        .contiguous()
}

/// Inverse of [`flatten_grid`] for a known grid geometry.
pub fn unflatten_grid(tokens: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (batch, count, channels) = tokens.dims3()?;
    if count != height * width {
        return Err(Error::Msg(format!(
            "sequence of {count} tokens does not fill a {height}x{width} grid"
        )));
    }
    tokens
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, channels, height, width))
}
