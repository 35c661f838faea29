//! Memory-efficient attention backend.
//!
//! Shares the projection and head-split layout of the dense path, but runs
//! the attention itself through the streaming [`kernel`], which never builds
//! the full similarity matrix. Masking and injection are not supported:
//! masked calls fail with [`AttentionError::UnsupportedMask`] and injection
//! with [`AttentionError::UnsupportedInjection`] rather than being silently
//! dropped. Absent those features, outputs match the dense backend within
//! floating-point tolerance.

pub mod kernel;

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};
use layers::{
    linear::{Linear, LinearConfig, LinearInit},
    PrecisionPolicy,
};

use crate::core::{AttentionEngine, AttentionError, EngineConfig};
use crate::injection::InjectionArgs;

/// Default number of keys consumed per streaming block.
pub const DEFAULT_KEY_BLOCK: usize = 128;

/// Streaming multi-head attention without mask or injection support.
pub struct MemoryEfficientAttention {
    config: EngineConfig,
    policy: PrecisionPolicy,
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    scale: f64,
    key_block: usize,
    first_call: OnceLock<()>,
}

impl std::fmt::Debug for MemoryEfficientAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEfficientAttention")
            .field("config", &self.config)
            .field("key_block", &self.key_block)
            .finish()
    }
}

impl MemoryEfficientAttention {
    /// Builds the engine with freshly initialised projections and the
    /// default key block size.
    pub fn new(
        config: EngineConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        Self::with_key_block(config, device, dtype, DEFAULT_KEY_BLOCK)
    }

    /// Builds the engine with an explicit key block size.
    pub fn with_key_block(
        config: EngineConfig,
        device: &Device,
        dtype: DType,
        key_block: usize,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let context_dim = config.context_dim_or_query();
        let to_q = Linear::with_init(
            LinearConfig::without_bias(config.query_dim, config.inner_dim),
            LinearInit::Uniform,
            device,
            dtype,
        )?;
        let to_k = Linear::with_init(
            LinearConfig::without_bias(context_dim, config.inner_dim),
            LinearInit::Uniform,
            device,
            dtype,
        )?;
        let to_v = Linear::with_init(
            LinearConfig::without_bias(context_dim, config.inner_dim),
            LinearInit::Uniform,
            device,
            dtype,
        )?;
        let to_out = Linear::with_init(
            LinearConfig::new(config.inner_dim, config.query_dim),
            LinearInit::Uniform,
            device,
            dtype,
        )?;
        let scale = (config.dim_head as f64).powf(-0.5);
        Ok(Self {
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            config,
            to_q,
            to_k,
            to_v,
            to_out,
            scale,
            key_block: key_block.max(1),
            first_call: OnceLock::new(),
        })
    }

    /// Copies the projection weights from a dense engine so the two backends
    /// can be compared parameter-for-parameter.
    pub fn from_dense(
        dense: &crate::reference::DenseAttention,
        key_block: usize,
    ) -> Result<Self, AttentionError> {
        let (to_q, to_k, to_v, to_out) = dense.projections();
        Ok(Self {
            config: dense.config().clone(),
            policy: PrecisionPolicy::from_parameter_dtype(to_q.weight().dtype()),
            to_q: to_q.clone(),
            to_k: to_k.clone(),
            to_v: to_v.clone(),
            to_out: to_out.clone(),
            scale: (dense.config().dim_head as f64).powf(-0.5),
            key_block: key_block.max(1),
            first_call: OnceLock::new(),
        })
    }

    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor, AttentionError> {
        let (batch, tokens, _) = tensor.dims3()?;
        let split = tensor
            .reshape((batch, tokens, self.config.heads, self.config.dim_head))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch * self.config.heads, tokens, self.config.dim_head))?;
        Ok(split)
    }
}

impl AttentionEngine for MemoryEfficientAttention {
    fn forward(
        &self,
        x: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        injection: Option<InjectionArgs<'_>>,
    ) -> Result<Tensor, AttentionError> {
        if mask.is_some() {
            return Err(AttentionError::UnsupportedMask {
                backend: "memory-efficient",
            });
        }
        if injection.map(|args| !args.qkv.is_empty()).unwrap_or(false) {
            return Err(AttentionError::UnsupportedInjection {
                backend: "memory-efficient",
            });
        }

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::memory_efficient init heads={} dim_head={} key_block={}",
                self.config.heads,
                self.config.dim_head,
                self.key_block,
            );
        }

        let (batch, q_tokens, width) = x
            .dims3()
            .map_err(|_| AttentionError::shape("input must be [batch, tokens, query_dim]"))?;
        if width != self.config.query_dim {
            return Err(AttentionError::shape(format!(
                "input width {width} does not match query_dim {}",
                self.config.query_dim
            )));
        }
        let context = context.unwrap_or(x);
        let (ctx_batch, _, ctx_width) = context
            .dims3()
            .map_err(|_| AttentionError::shape("context must be [batch, tokens, context_dim]"))?;
        if ctx_batch != batch || ctx_width != self.config.context_dim_or_query() {
            return Err(AttentionError::shape(format!(
                "context shape {:?} incompatible with batch {batch} and context_dim {}",
                context.dims(),
                self.config.context_dim_or_query()
            )));
        }

        let q = self.split_heads(&self.to_q.forward(x, &self.policy)?)?;
        let k = self.split_heads(&self.to_k.forward(context, &self.policy)?)?;
        let v = self.split_heads(&self.to_v.forward(context, &self.policy)?)?;

        let weighted = kernel::attend(&q, &k, &v, self.scale, self.key_block)?;
        let merged = weighted
            .reshape((batch, self.config.heads, q_tokens, self.config.dim_head))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_tokens, self.config.inner_dim))?;
        Ok(self.to_out.forward(&merged, &self.policy)?)
    }

    fn supports_mask(&self) -> bool {
        false
    }

    fn supports_injection(&self) -> bool {
        false
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }
}
