//! Key-block streaming attention kernel.
//!
//! Computes `softmax(Q . K^T * scale) . V` without materialising the full
//! similarity matrix: keys and values are consumed in blocks while a running
//! row maximum and normaliser are maintained (online softmax), so peak
//! memory scales with the block size instead of the key count.

use candle_core::{DType, Result, Tensor, D};

/// Runs streaming attention over head-split tensors.
///
/// `q`, `k`, `v` are `[heads_batch, tokens, dim_head]` and share a dtype;
/// reductions run in `f32` and the output matches `q`'s shape and dtype.
pub fn attend(q: &Tensor, k: &Tensor, v: &Tensor, scale: f64, key_block: usize) -> Result<Tensor> {
    let dtype = q.dtype();
    let (heads_batch, q_tokens, dim_head) = q.dims3()?;
    let (_, k_tokens, _) = k.dims3()?;
    let device = q.device();

    let q = q.to_dtype(DType::F32)?;
    let k = k.to_dtype(DType::F32)?;
    let v = v.to_dtype(DType::F32)?;

    let mut running_max = Tensor::full(f32::NEG_INFINITY, (heads_batch, q_tokens, 1), device)?;
    let mut normalizer = Tensor::zeros((heads_batch, q_tokens, 1), DType::F32, device)?;
    let mut accumulator = Tensor::zeros((heads_batch, q_tokens, dim_head), DType::F32, device)?;

    let block = key_block.max(1);
    let mut start = 0;
    while start < k_tokens {
        let len = block.min(k_tokens - start);
        let k_block = k.narrow(1, start, len)?;
        let v_block = v.narrow(1, start, len)?;

        let scores = q
            .matmul(&k_block.transpose(1, 2)?)?
            .affine(scale, 0.0)?;
        let block_max = scores.max_keepdim(D::Minus1)?;
        let new_max = running_max.maximum(&block_max)?;

        // Rescale previous accumulation to the new maximum before folding
        // in this block's contribution.
        let carry = running_max.sub(&new_max)?.exp()?;
        let probs = scores.broadcast_sub(&new_max)?.exp()?;

        normalizer = normalizer
            .mul(&carry)?
            .add(&probs.sum_keepdim(D::Minus1)?)?;
        accumulator = accumulator
            .broadcast_mul(&carry)?
            .add(&probs.matmul(&v_block)?)?;
        running_max = new_max;
        start += len;
    }

    accumulator.broadcast_div(&normalizer)?.to_dtype(dtype)
}
