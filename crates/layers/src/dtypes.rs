//! Precision and dtype policies used throughout the workspace.
//!
//! Parameters typically reside in `f16`/`bf16` during inference while the
//! similarity-score step of attention promotes to `f32` to avoid overflow.
//! [`PrecisionPolicy`] centralises the casts around matmuls and reductions;
//! [`SimilarityPrecision`] is the explicit replacement for the upstream
//! `ATTN_PRECISION` environment toggle so behaviour stays reproducible
//! without ambient process state.

use candle_core::{DType, Result, Tensor};

/// Controls whether Q and K are force-upcast to `f32` before the similarity
/// matmul.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarityPrecision {
    /// Upcast Q and K to `f32` for the `Q . K^T` product regardless of the
    /// surrounding precision mode. The default, and the numerically safe
    /// choice for half-precision inference.
    ForceF32,
    /// Keep the incoming dtype for the similarity product.
    Inherit,
}

impl Default for SimilarityPrecision {
    fn default() -> Self {
        Self::ForceF32
    }
}

impl SimilarityPrecision {
    /// Reads the legacy `ATTN_PRECISION` variable. `"fp32"` or an unset
    /// variable selects [`SimilarityPrecision::ForceF32`]; any other value
    /// selects [`SimilarityPrecision::Inherit`].
    pub fn from_env() -> Self {
        match std::env::var("ATTN_PRECISION") {
            Ok(value) if value != "fp32" => Self::Inherit,
            _ => Self::ForceF32,
        }
    }
}

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype. Half-precision
    /// parameters compute in `f32`; reductions always run in `f32`.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute, DType::F32)
    }

    /// Returns the dtype used to store parameters and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls and activation evaluation.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Returns the dtype used for reductions such as normalization statistics.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Indicates whether the policy performs mixed precision work.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

/// Most negative finite value representable in `dtype`, used to blank out
/// masked similarity entries before softmax.
pub fn max_neg_value(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => -65504.0,
        DType::BF16 => -3.3895314e38,
        DType::F64 => f64::MIN,
        _ => f32::MIN as f64,
    }
}
