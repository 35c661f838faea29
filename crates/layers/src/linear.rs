//! Dense and 1x1-convolution projections.
//!
//! [`Linear`] maps `(batch, tokens, in_dim)` to `(batch, tokens, out_dim)`;
//! [`Conv1x1`] is the grid-form equivalent, a per-pixel linear map over
//! `(batch, channels, height, width)`. Both cast activations and weights to
//! [`PrecisionPolicy::compute`] for the matmul and back to storage dtype
//! afterwards. The attention projections are bias-free; output projections
//! may carry a bias and can be zero-initialised so a freshly constructed
//! block acts as the identity.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense and 1x1-conv projections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension (channels for [`Conv1x1`]).
    pub input_dim: usize,
    /// Outgoing feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration with a bias, matching torch defaults.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Creates a bias-free configuration, used for Q/K/V projections.
    pub fn without_bias(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
        }
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone, Copy)]
pub enum LinearInit {
    /// Uniform in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`, the classic
    /// torch linear default.
    Uniform,
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// All-zero weights (and bias); makes the projection the zero map so the
    /// enclosing residual block starts out as the identity.
    Zeros,
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let weight_f32 = match self {
            LinearInit::Uniform => {
                let bound = 1.0 / (in_dim as f64).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierUniform => {
                let bound = (6.0 / (in_dim as f64 + out_dim as f64)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::Zeros => Tensor::zeros(shape, DType::F32, device)?,
        };
        if dtype == DType::F32 {
            Ok(weight_f32)
        } else {
            weight_f32.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        validate_params(&config, &weight, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with weights drawn from `init`.
    pub fn with_init(
        config: LinearConfig,
        init: LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns the static configuration used to validate inputs.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns the weight tensor, shaped `[output_dim, input_dim]`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Applies the projection. Accepts `(batch, tokens, in)` or `(rows, in)`.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;

        let mut output = match input.dims() {
            [batch, tokens, in_dim] if *in_dim == self.config.input_dim => {
                let flat = input.reshape((batch * tokens, self.config.input_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((*batch, *tokens, self.config.output_dim))?
            }
            [_, in_dim] if *in_dim == self.config.input_dim => input.matmul(&weight_t)?,
            dims => {
                return Err(Error::Msg(format!(
                    "linear expects trailing dim {}, got shape {dims:?}",
                    self.config.input_dim
                )))
            }
        };

        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_matmul(bias)?;
            output = output.broadcast_add(&bias)?;
        }
        policy.cast_to_storage(&output)
    }
}

/// 1x1 convolution over grid tensors, equivalent to [`Linear`] applied per
/// pixel.
#[derive(Debug, Clone)]
pub struct Conv1x1 {
    inner: Linear,
}

impl Conv1x1 {
    /// Constructs a 1x1 convolution from pre-existing parameters. The weight
    /// is shaped `[out_channels, in_channels]`.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Ok(Self {
            inner: Linear::new(config, weight, bias)?,
        })
    }

    /// Builds a 1x1 convolution with weights drawn from `init`.
    pub fn with_init(
        config: LinearConfig,
        init: LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        Ok(Self {
            inner: Linear::with_init(config, init, device, dtype)?,
        })
    }

    /// Returns the static configuration used to validate inputs.
    pub fn config(&self) -> &LinearConfig {
        self.inner.config()
    }

    /// Applies the channel mix to a `(batch, channels, height, width)` grid.
    pub fn forward(&self, grid: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_bchw("conv1x1.input", grid, self.inner.config().input_dim)?;
        let (batch, _, height, width) = grid.dims4()?;

        let tokens = grid
            .reshape((batch, self.inner.config().input_dim, height * width))?
            .transpose(1, 2)?
            .contiguous()?;
        let mixed = self.inner.forward(&tokens, policy)?;
        mixed
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, self.inner.config().output_dim, height, width))
    }
}

fn validate_params(config: &LinearConfig, weight: &Tensor, bias: Option<&Tensor>) -> Result<()> {
    checks::expect_rank("linear.weight", weight, 2)?;
    checks::expect_shape(
        "linear.weight",
        weight,
        &[config.output_dim, config.input_dim],
    )?;
    checks::expect_dtype_in(
        "linear.weight",
        weight,
        &[DType::F16, DType::BF16, DType::F32],
    )?;
    match (config.bias, bias) {
        (true, Some(tensor)) => {
            checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
            Ok(())
        }
        (false, None) => Ok(()),
        (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
        (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
    }
}
