//! Dense multi-head scaled dot-product attention with injection support.

use std::sync::{Arc, OnceLock};

use candle_core::{DType, Device, Tensor};
use candle_nn::ops::softmax_last_dim;
use layers::{
    dtypes::max_neg_value,
    linear::{Linear, LinearConfig, LinearInit},
    PrecisionPolicy, SimilarityPrecision,
};

use crate::core::{
    AttentionEngine, AttentionError, AttentionObserver, AttentionSnapshot, EngineConfig,
};
use crate::injection::{InjectedQkv, InjectionArgs};

/// The reference attention engine.
///
/// Q comes from the input, K and V from the context (or the input itself
/// when no context is given), all through bias-free projections. Heads are
/// folded into the batch axis for the similarity product, which is upcast to
/// `f32` under [`SimilarityPrecision::ForceF32`]. Supports boolean key masks
/// and Q/K/V injection; invokes the registered observer with the head-split
/// Q/K/V and the attention probabilities after every successful call.
pub struct DenseAttention {
    config: EngineConfig,
    policy: PrecisionPolicy,
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    scale: f64,
    observer: Option<Arc<dyn AttentionObserver>>,
    first_call: OnceLock<()>,
}

impl std::fmt::Debug for DenseAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenseAttention")
            .field("config", &self.config)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

impl DenseAttention {
    /// Builds the engine with freshly initialised projections.
    pub fn new(
        config: EngineConfig,
        device: &Device,
        dtype: DType,
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
            observer: None,
            first_call: OnceLock::new(),
        })
    }

    /// Registers an observer that receives Q/K/V and the probability matrix
    /// of every subsequent successful call.
    pub fn set_observer(&mut self, observer: Arc<dyn AttentionObserver>) {
        self.observer = Some(observer);
    }

    /// Shared access to the q/k/v/out projections, used to seed a twin
    /// backend with identical parameters.
    pub fn projections(&self) -> (&Linear, &Linear, &Linear, &Linear) {
        (&self.to_q, &self.to_k, &self.to_v, &self.to_out)
    }

    /// `[batch, tokens, inner] -> [batch * heads, tokens, dim_head]`.
    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor, AttentionError> {
        let (batch, tokens, inner) = tensor
            .dims3()
            .map_err(|_| AttentionError::shape("projection output must be rank 3"))?;
        if inner != self.config.inner_dim {
            return Err(AttentionError::shape(format!(
                "projection width {inner} does not match inner_dim {}",
                self.config.inner_dim
            )));
        }
        let split = tensor
            .reshape((batch, tokens, self.config.heads, self.config.dim_head))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch * self.config.heads, tokens, self.config.dim_head))?;
        Ok(split)
    }

    /// `[batch * heads, tokens, dim_head] -> [batch, tokens, inner]`.
    fn merge_heads(&self, tensor: &Tensor, batch: usize) -> Result<Tensor, AttentionError> {
        let (_, tokens, _) = tensor.dims3()?;
        let merged = tensor
            .reshape((batch, self.config.heads, tokens, self.config.dim_head))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, tokens, self.config.inner_dim))?;
        Ok(merged)
    }

    /// Replicates a batch-1 injected tensor across the live batch.
    fn replicate_injected(
        &self,
        tensor: &Tensor,
        name: &str,
        batch: usize,
    ) -> Result<Tensor, AttentionError> {
        InjectedQkv::validate_component(tensor, name, self.config.heads, self.config.dim_head)?;
        let copies: Vec<Tensor> = std::iter::repeat(tensor.clone()).take(batch).collect();
        Ok(Tensor::cat(&copies, 0)?)
    }

    fn assemble_q(
        &self,
        x: &Tensor,
        injection: Option<&InjectionArgs<'_>>,
        batch: usize,
    ) -> Result<Tensor, AttentionError> {
        let fresh = self.split_heads(&self.to_q.forward(x, &self.policy)?)?;
        let injected = injection.and_then(|args| args.qkv.q.as_ref());
        match injected {
            None => Ok(fresh),
            Some(q_injected) => {
                let gamma = injection
                    .map(|args| args.config.query_mix)
                    .unwrap_or_default();
                let replicated = self
                    .replicate_injected(q_injected, "q", batch)?
                    .to_dtype(fresh.dtype())?;
                if replicated.dims() != fresh.dims() {
                    return Err(AttentionError::shape(format!(
                        "injected q shape {:?} does not blend with fresh q {:?}",
                        replicated.dims(),
                        fresh.dims()
                    )));
                }
                let blended = replicated
                    .affine(gamma, 0.0)?
                    .add(&fresh.affine(1.0 - gamma, 0.0)?)?;
                Ok(blended)
            }
        }
    }

    fn assemble_kv(
        &self,
        context: &Tensor,
        injection: Option<&InjectionArgs<'_>>,
        batch: usize,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        let k = match injection.and_then(|args| args.qkv.k.as_ref()) {
            Some(k_injected) => self.replicate_injected(k_injected, "k", batch)?,
            None => self.split_heads(&self.to_k.forward(context, &self.policy)?)?,
        };
        let v = match injection.and_then(|args| args.qkv.v.as_ref()) {
            Some(v_injected) => self.replicate_injected(v_injected, "v", batch)?,
            None => self.split_heads(&self.to_v.forward(context, &self.policy)?)?,
        };
        let (_, k_tokens, _) = k.dims3()?;
        let (_, v_tokens, _) = v.dims3()?;
        if k_tokens != v_tokens {
            return Err(AttentionError::shape(format!(
                "k has {k_tokens} tokens but v has {v_tokens}"
            )));
        }
        Ok((k, v))
    }

    /// Blanks masked-out similarity entries with the most negative finite
    /// value of the working dtype.
    fn apply_mask(
        &self,
        sim: Tensor,
        mask: &Tensor,
        batch: usize,
        q_tokens: usize,
        k_tokens: usize,
    ) -> Result<Tensor, AttentionError> {
        if mask.dtype() != DType::U8 {
            return Err(AttentionError::shape(format!(
                "key mask must be dtype U8, got {:?}",
                mask.dtype()
            )));
        }
        let (mask_batch, mask_keys) = mask
            .dims2()
            .map_err(|_| AttentionError::shape("key mask must be [batch, context_tokens]"))?;
        if mask_batch != batch || mask_keys != k_tokens {
            return Err(AttentionError::shape(format!(
                "key mask shape [{mask_batch}, {mask_keys}] does not match [{batch}, {k_tokens}]"
            )));
        }

        let heads = self.config.heads;
        let keep = mask
            .reshape((batch, 1, 1, k_tokens))?
            .broadcast_as((batch, heads, q_tokens, k_tokens))?
            .contiguous()?;
        let sim4 = sim.reshape((batch, heads, q_tokens, k_tokens))?;
        let fill = Tensor::full(
            max_neg_value(sim4.dtype()) as f32,
            (batch, heads, q_tokens, k_tokens),
            sim4.device(),
        )?
        .to_dtype(sim4.dtype())?;
        let masked = keep.where_cond(&sim4, &fill)?;
        Ok(masked.reshape((batch * heads, q_tokens, k_tokens))?)
    }
}

impl AttentionEngine for DenseAttention {
    fn forward(
        &self,
        x: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        injection: Option<InjectionArgs<'_>>,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::dense init heads={} dim_head={} query_dim={} context_dim={} precision={:?}",
                self.config.heads,
                self.config.dim_head,
                self.config.query_dim,
                self.config.context_dim_or_query(),
                self.config.precision,
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
        if ctx_batch != batch {
            return Err(AttentionError::shape(format!(
                "context batch {ctx_batch} does not match input batch {batch}"
            )));
        }
        if ctx_width != self.config.context_dim_or_query() {
            return Err(AttentionError::shape(format!(
                "context width {ctx_width} does not match context_dim {}",
                self.config.context_dim_or_query()
            )));
        }

        let injection = injection.filter(|args| !args.qkv.is_empty());

        let q = self.assemble_q(x, injection.as_ref(), batch)?;
        let (k, v) = self.assemble_kv(context, injection.as_ref(), batch)?;
        let (_, k_tokens, _) = k.dims3()?;

        // Forced upcast of the similarity product; exempt from the
        // surrounding storage precision.
        let (q_work, k_work) = match self.config.precision {
            SimilarityPrecision::ForceF32 => {
                (q.to_dtype(DType::F32)?, k.to_dtype(DType::F32)?)
            }
            SimilarityPrecision::Inherit => (q.clone(), k.clone()),
        };
        let mut sim = q_work.matmul(&k_work.transpose(1, 2)?)?;

        if injection
            .as_ref()
            .map(|args| args.qkv.rescales_logits())
            .unwrap_or(false)
        {
            let logit_scale = injection
                .as_ref()
                .map(|args| args.config.logit_scale)
                .unwrap_or(1.0);
            sim = sim.affine(logit_scale, 0.0)?;
        }
        sim = sim.affine(self.scale, 0.0)?;

        if let Some(mask) = mask {
            sim = self.apply_mask(sim, mask, batch, q_tokens, k_tokens)?;
        }

        let probs = softmax_last_dim(&sim)?;
        if let Some(observer) = &self.observer {
            observer.record(AttentionSnapshot {
                q: q.clone(),
                k: k.clone(),
                v: v.clone(),
                probs: probs.clone(),
            });
        }

        let weighted = probs.to_dtype(v.dtype())?.matmul(&v)?;
        let merged = self.merge_heads(&weighted, batch)?;
        Ok(self.to_out.forward(&merged, &self.policy)?)
    }

    fn supports_mask(&self) -> bool {
        true
    }

    fn supports_injection(&self) -> bool {
        true
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RecordingObserver;
    use crate::injection::InjectionConfig;
    use crate::masks::key_padding_mask_from_booleans;
    use candle_core::{Device, Result as CandleResult};

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    fn engine(query_dim: usize, heads: usize, dim_head: usize) -> DenseAttention {
        DenseAttention::new(
            EngineConfig::new(query_dim, heads, dim_head),
            &Device::Cpu,
            DType::F32,
        )
        .unwrap()
    }

    #[test]
    fn single_head_matches_straight_line_computation() -> CandleResult<()> {
        let device = Device::Cpu;
        let engine = engine(6, 1, 6);
        let x = Tensor::randn(0f32, 1.0, (2, 5, 6), &device)?;
        let out = engine.forward(&x, None, None, None).unwrap();
        assert_eq!(out.dims(), &[2, 5, 6]);

        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let q = engine.to_q.forward(&x, &policy)?;
        let k = engine.to_k.forward(&x, &policy)?;
        let v = engine.to_v.forward(&x, &policy)?;
        let sim = q.matmul(&k.transpose(1, 2)?)?.affine(6f64.powf(-0.5), 0.0)?;
        let probs = softmax_last_dim(&sim)?;
        let expected = engine
            .to_out
            .forward(&probs.matmul(&v)?, &policy)?;
        assert!(max_diff(&out, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn output_projection_restores_query_dim() -> CandleResult<()> {
        let device = Device::Cpu;
        // inner_dim (8) deliberately differs from query_dim (10).
        let engine = engine(10, 2, 4);
        let x = Tensor::randn(0f32, 1.0, (1, 3, 10), &device)?;
        let out = engine.forward(&x, None, None, None).unwrap();
        assert_eq!(out.dims(), &[1, 3, 10]);
        Ok(())
    }

    #[test]
    fn cross_attention_uses_context_width() -> CandleResult<()> {
        let device = Device::Cpu;
        let mut config = EngineConfig::new(8, 2, 4);
        config.context_dim = Some(12);
        let engine = DenseAttention::new(config, &device, DType::F32).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?;
        let context = Tensor::randn(0f32, 1.0, (2, 7, 12), &device)?;
        let out = engine.forward(&x, Some(&context), None, None).unwrap();
        assert_eq!(out.dims(), &[2, 4, 8]);

        // Handing the self-attention input where the context is expected
        // must fail on width.
        let err = engine.forward(&x, Some(&x), None, None).unwrap_err();
        assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
        Ok(())
    }

    #[test]
    fn construction_rejects_bad_inner_dim() {
        let mut config = EngineConfig::new(8, 2, 4);
        config.inner_dim = 7;
        let err = DenseAttention::new(config, &Device::Cpu, DType::F32).unwrap_err();
        assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
    }

    #[test]
    fn injected_q_with_full_mix_replaces_fresh_q() -> CandleResult<()> {
        let device = Device::Cpu;
        let mut engine = engine(8, 2, 4);
        let observer = RecordingObserver::shared();
        engine.set_observer(observer.clone());

        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
        let q_injected = Tensor::randn(0f32, 1.0, (2, 3, 4), &device)?;
        let qkv = InjectedQkv {
            q: Some(q_injected.clone()),
            ..Default::default()
        };
        let config = InjectionConfig {
            logit_scale: 1.0,
            query_mix: 1.0,
        };
        engine
            .forward(&x, None, None, Some(InjectionArgs { qkv: &qkv, config: &config }))
            .unwrap();

        let snapshot = observer.last().expect("observer fired");
        let replicated = Tensor::cat(&[q_injected.clone(), q_injected], 0)?;
        assert!(max_diff(&snapshot.q, &replicated)? < 1e-6);
        Ok(())
    }

    #[test]
    fn injected_q_with_zero_mix_matches_plain_path() -> CandleResult<()> {
        let device = Device::Cpu;
        let engine = engine(8, 2, 4);
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
        let plain = engine.forward(&x, None, None, None).unwrap();

        let qkv = InjectedQkv {
            q: Some(Tensor::randn(0f32, 1.0, (2, 3, 4), &device)?),
            ..Default::default()
        };
        // gamma = 0: the injected q contributes nothing, but T = 1 keeps the
        // similarity rescale a no-op, so the outputs must agree exactly.
        let config = InjectionConfig {
            logit_scale: 1.0,
            query_mix: 0.0,
        };
        let injected = engine
            .forward(&x, None, None, Some(InjectionArgs { qkv: &qkv, config: &config }))
            .unwrap();
        assert!(max_diff(&plain, &injected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn injected_kv_replace_fresh_projections() -> CandleResult<()> {
        let device = Device::Cpu;
        let mut engine = engine(8, 2, 4);
        let observer = RecordingObserver::shared();
        engine.set_observer(observer.clone());

        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &device)?;
        let k_injected = Tensor::randn(0f32, 1.0, (2, 5, 4), &device)?;
        let v_injected = Tensor::randn(0f32, 1.0, (2, 5, 4), &device)?;
        let qkv = InjectedQkv {
            k: Some(k_injected.clone()),
            v: Some(v_injected.clone()),
            ..Default::default()
        };
        let config = InjectionConfig::default();
        let out = engine
            .forward(&x, None, None, Some(InjectionArgs { qkv: &qkv, config: &config }))
            .unwrap();
        assert_eq!(out.dims(), &[1, 3, 8]);

        let snapshot = observer.last().unwrap();
        assert!(max_diff(&snapshot.k, &k_injected)? < 1e-6);
        assert!(max_diff(&snapshot.v, &v_injected)? < 1e-6);
        // Probabilities now span the injected key length.
        assert_eq!(snapshot.probs.dims(), &[2, 3, 5]);
        Ok(())
    }

    #[test]
    fn logit_scale_rescales_similarity_globally() -> CandleResult<()> {
        let device = Device::Cpu;
        let mut engine = engine(8, 2, 4);
        let observer = RecordingObserver::shared();
        engine.set_observer(observer.clone());

        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?;
        let q_injected = Tensor::randn(0f32, 1.0, (2, 4, 4), &device)?;
        let qkv = InjectedQkv {
            q: Some(q_injected),
            ..Default::default()
        };

        let sharp = InjectionConfig {
            logit_scale: 4.0,
            query_mix: 1.0,
        };
        engine
            .forward(&x, None, None, Some(InjectionArgs { qkv: &qkv, config: &sharp }))
            .unwrap();
        let sharp_probs = observer.last().unwrap().probs;

        let neutral = InjectionConfig {
            logit_scale: 1.0,
            query_mix: 1.0,
        };
        engine
            .forward(&x, None, None, Some(InjectionArgs { qkv: &qkv, config: &neutral }))
            .unwrap();
        let neutral_probs = observer.last().unwrap().probs;

        // A larger T sharpens the distribution, so the per-row maxima grow.
        let sharp_max = sharp_probs.max_all()?.to_vec0::<f32>()?;
        let neutral_max = neutral_probs.max_all()?.to_vec0::<f32>()?;
        assert!(sharp_max >= neutral_max);
        Ok(())
    }

    #[test]
    fn masked_keys_receive_zero_probability() -> CandleResult<()> {
        let device = Device::Cpu;
        let mut engine = engine(8, 2, 4);
        let observer = RecordingObserver::shared();
        engine.set_observer(observer.clone());

        let x = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?;
        let mask = key_padding_mask_from_booleans(
            &device,
            &[vec![true, true, false, true], vec![true, false, false, true]],
        )?;
        engine.forward(&x, None, Some(&mask), None).unwrap();

        let probs = observer.last().unwrap().probs; // [batch*heads, 4, 4]
        let values = probs.flatten_all()?.to_vec1::<f32>()?;
        let heads = 2;
        let masked_cols: [&[usize]; 2] = [&[2], &[1, 2]];
        for b in 0..2 {
            for h in 0..heads {
                for row in 0..4 {
                    let base = (((b * heads + h) * 4) + row) * 4;
                    let mut sum = 0f32;
                    for col in 0..4 {
                        let p = values[base + col];
                        if masked_cols[b].contains(&col) {
                            assert!(p < 1e-6, "masked key got probability {p}");
                        }
                        sum += p;
                    }
                    assert!((sum - 1.0).abs() < 1e-5, "row sum {sum}");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn mask_shape_is_validated() {
        let device = Device::Cpu;
        let engine = engine(8, 2, 4);
        let x = Tensor::randn(0f32, 1.0, (2, 4, 8), &device).unwrap();
        let mask = Tensor::zeros((2, 7), DType::U8, &device).unwrap();
        let err = engine.forward(&x, None, Some(&mask), None).unwrap_err();
        assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
    }

    #[test]
    fn injection_and_mask_combine() -> CandleResult<()> {
        let device = Device::Cpu;
        let mut engine = engine(8, 2, 4);
        let observer = RecordingObserver::shared();
        engine.set_observer(observer.clone());

        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?;
        let qkv = InjectedQkv {
            q: Some(Tensor::randn(0f32, 1.0, (2, 4, 4), &device)?),
            ..Default::default()
        };
        let config = InjectionConfig {
            logit_scale: 2.0,
            query_mix: 0.5,
        };
        let mask = key_padding_mask_from_booleans(&device, &[vec![true, true, true, false]])?;
        engine
            .forward(&x, None, Some(&mask), Some(InjectionArgs { qkv: &qkv, config: &config }))
            .unwrap();

        let probs = observer.last().unwrap().probs;
        let values = probs.flatten_all()?.to_vec1::<f32>()?;
        for row in 0..values.len() / 4 {
            assert!(values[row * 4 + 3] < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn half_precision_input_stays_finite_with_forced_upcast() -> CandleResult<()> {
        let device = Device::Cpu;
        let engine = DenseAttention::new(EngineConfig::new(8, 2, 4), &device, DType::F16).unwrap();
        let x = Tensor::randn(0f32, 4.0, (1, 6, 8), &device)?.to_dtype(DType::F16)?;
        let out = engine.forward(&x, None, None, None).unwrap();
        assert_eq!(out.dtype(), DType::F16);
        let values = out
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn configured_dropout_rate_keeps_inference_deterministic() -> CandleResult<()> {
        let device = Device::Cpu;
        let mut config = EngineConfig::new(8, 2, 4);
        config.dropout_p = Some(0.5);
        let engine = DenseAttention::new(config, &device, DType::F32).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?;
        let first = engine.forward(&x, None, None, None).unwrap();
        let second = engine.forward(&x, None, None, None).unwrap();
        assert_eq!(max_diff(&first, &second)?, 0.0);
        Ok(())
    }

    #[test]
    fn capabilities_are_declared() {
        let engine = engine(8, 2, 4);
        assert!(engine.supports_mask());
        assert!(engine.supports_injection());
    }
}
