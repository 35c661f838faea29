//! Pre-norm transformer block: attention, cross-attention, feed-forward.

use std::sync::Arc;

use attention::{
    AttentionEngine, AttentionError, AttentionObserver, DenseAttention, EngineConfig,
    InjectionArgs, MemoryEfficientAttention,
};
use candle_core::{DType, Device, Error, Result, Tensor};
use layers::{
    FeedForward, FeedForwardConfig, LayerNorm, LayerNormConfig, LinearInit, PrecisionPolicy,
};

use crate::checkpoint::Checkpoint;
use crate::config::{AttentionBackend, TransformerBlockConfig};

fn attn_err(err: AttentionError) -> Error {
    Error::Msg(err.to_string())
}

/// One transformer block over `[batch, tokens, dim]` sequences.
///
/// Three pre-norm residual sublayers: attention over the input tokens (self,
/// or cross when `disable_self_attn` routes the context in), cross-attention
/// against the conditioning sequence, and the feed-forward. Injection
/// arguments reach only the first sublayer; that is the one whose Q/K/V a
/// prompt-edit run replays.
pub struct TransformerBlock {
    config: TransformerBlockConfig,
    policy: PrecisionPolicy,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
    attn1: Box<dyn AttentionEngine>,
    attn2: Box<dyn AttentionEngine>,
    ff: FeedForward,
    checkpoint: Checkpoint,
}

impl std::fmt::Debug for TransformerBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerBlock")
            .field("config", &self.config)
            .finish()
    }
}

impl TransformerBlock {
    pub fn new(config: TransformerBlockConfig, device: &Device, dtype: DType) -> Result<Self> {
        Self::build(config, device, dtype, None)
    }

    /// Builds the block with `observer` attached to the first attention
    /// sublayer. Requires the reference backend; the memory-efficient engine
    /// never materialises the probability matrix the observer reports.
    pub fn with_observer(
        config: TransformerBlockConfig,
        device: &Device,
        dtype: DType,
        observer: Arc<dyn AttentionObserver>,
    ) -> Result<Self> {
        if config.backend != AttentionBackend::Reference {
            return Err(Error::Msg(
                "attention observers require the reference backend".into(),
            ));
        }
        Self::build(config, device, dtype, Some(observer))
    }

    fn build(
        config: TransformerBlockConfig,
        device: &Device,
        dtype: DType,
        observer: Option<Arc<dyn AttentionObserver>>,
    ) -> Result<Self> {
        let mut attn1_config = EngineConfig::new(config.dim, config.n_heads, config.d_head);
        attn1_config.dropout_p = config.dropout_p;
        attn1_config.precision = config.precision;
        let mut attn2_config = attn1_config.clone();
        if config.disable_self_attn {
            attn1_config.context_dim = config.context_dim;
        }
        attn2_config.context_dim = config.context_dim;

        let attn1 = build_engine(attn1_config, config.backend, device, dtype, observer)?;
        let attn2 = build_engine(attn2_config, config.backend, device, dtype, None)?;

        let ff_config = FeedForwardConfig {
            dim: config.dim,
            dim_out: None,
            mult: 4,
            gated: config.gated_ff,
            dropout_p: config.dropout_p,
        };
        let ff = FeedForward::with_init(ff_config, LinearInit::Uniform, device, dtype)?;

        let norm_config = LayerNormConfig::new(config.dim);
        Ok(Self {
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            norm1: LayerNorm::identity(norm_config.clone(), device, dtype)?,
            norm2: LayerNorm::identity(norm_config.clone(), device, dtype)?,
            norm3: LayerNorm::identity(norm_config, device, dtype)?,
            attn1,
            attn2,
            ff,
            checkpoint: Checkpoint::new(config.checkpoint),
            config,
        })
    }

    pub fn config(&self) -> &TransformerBlockConfig {
        &self.config
    }

    /// Runs the block. `context` feeds the cross-attention sublayer (and the
    /// first sublayer too under `disable_self_attn`); `injection` feeds only
    /// the first sublayer.
    pub fn forward(
        &self,
        x: &Tensor,
        context: Option<&Tensor>,
        injection: Option<InjectionArgs<'_>>,
    ) -> Result<Tensor> {
        let attn1_context = if self.config.disable_self_attn {
            context
        } else {
            None
        };

        let attended = self.checkpoint.run(|| {
            let normed = self.norm1.forward(x, &self.policy)?;
            self.attn1
                .forward(&normed, attn1_context, None, injection)
                .map_err(attn_err)
        })?;
        let x = (x + attended)?;

        let cross = self.checkpoint.run(|| {
            let normed = self.norm2.forward(&x, &self.policy)?;
            self.attn2
                .forward(&normed, context, None, None)
                .map_err(attn_err)
        })?;
        let x = (x + cross)?;

        let fed = self.checkpoint.run(|| {
            let normed = self.norm3.forward(&x, &self.policy)?;
            self.ff.forward(&normed, &self.policy)
        })?;
        x + fed
    }
}

fn build_engine(
    config: EngineConfig,
    backend: AttentionBackend,
    device: &Device,
    dtype: DType,
    observer: Option<Arc<dyn AttentionObserver>>,
) -> Result<Box<dyn AttentionEngine>> {
    log::debug!(
        "building {backend:?} attention engine, query_dim={} heads={}",
        config.query_dim,
        config.heads,
    );
    match backend {
        AttentionBackend::Reference => {
            let mut engine = DenseAttention::new(config, device, dtype).map_err(attn_err)?;
            if let Some(observer) = observer {
                engine.set_observer(observer);
            }
            Ok(Box::new(engine))
        }
        AttentionBackend::MemoryEfficient => {
            let engine = MemoryEfficientAttention::new(config, device, dtype).map_err(attn_err)?;
            Ok(Box::new(engine))
        }
    }
}
