//! Q/K/V injection: splicing attention inputs from a reference generation
//! pass into the current pass.
//!
//! Injected tensors come from a batch-1 (typically unconditional) pass and
//! are already head-split, shaped `[heads, tokens, dim_head]`. Inside the
//! engine they are replicated across the live batch. Injected K and V
//! replace the fresh projections outright; an injected Q is blended with the
//! fresh projection under `query_mix`. Whenever Q or K is injected the raw
//! similarity matrix is additionally rescaled by `logit_scale`, globally and
//! not only on injected entries, matching the observed upstream behaviour.

use candle_core::Tensor;

use crate::core::errors::AttentionError;

/// Mixing schedule for an injected attention call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InjectionConfig {
    /// `T`: multiplier applied to the raw similarity logits before the
    /// `dim_head^-0.5` scale. `1.0` is a no-op.
    pub logit_scale: f64,
    /// `gamma`: blend weight of the injected query;
    /// `q = injected * gamma + fresh * (1 - gamma)`.
    pub query_mix: f64,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            logit_scale: 1.0,
            query_mix: 0.0,
        }
    }
}

/// Optional externally supplied attention inputs.
///
/// Each present tensor must be head-split `[heads, tokens, dim_head]` from a
/// batch-1 reference pass.
#[derive(Debug, Clone, Default)]
pub struct InjectedQkv {
    pub q: Option<Tensor>,
    pub k: Option<Tensor>,
    pub v: Option<Tensor>,
}

impl InjectedQkv {
    /// True when no tensor is actually supplied.
    pub fn is_empty(&self) -> bool {
        self.q.is_none() && self.k.is_none() && self.v.is_none()
    }

    /// Whether the similarity rescale by `logit_scale` applies: it fires
    /// when Q or K (not V alone) is injected.
    pub fn rescales_logits(&self) -> bool {
        self.q.is_some() || self.k.is_some()
    }

    pub(crate) fn validate_component(
        tensor: &Tensor,
        name: &str,
        heads: usize,
        dim_head: usize,
    ) -> Result<(), AttentionError> {
        let (hb, _tokens, d) = tensor.dims3().map_err(|_| {
            AttentionError::shape(format!(
                "injected {name} must be head-split [heads, tokens, dim_head]"
            ))
        })?;
        if hb != heads {
            return Err(AttentionError::shape(format!(
                "injected {name} carries {hb} head rows, engine has {heads} heads"
            )));
        }
        if d != dim_head {
            return Err(AttentionError::shape(format!(
                "injected {name} has head width {d}, engine expects {dim_head}"
            )));
        }
        Ok(())
    }
}

/// Borrowed injection arguments for one forward call.
#[derive(Debug, Clone, Copy)]
pub struct InjectionArgs<'a> {
    pub qkv: &'a InjectedQkv,
    pub config: &'a InjectionConfig,
}
