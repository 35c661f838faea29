//! Single-head self-attention over a spatial grid.
//!
//! Operates on `[B, C, H, W]` feature maps directly: every pixel attends to
//! every other pixel of the same image, with channel-preserving 1x1
//! projections and a residual connection around the whole layer.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::ops::softmax_last_dim;
use layers::{
    checks, Conv1x1, GroupNorm, GroupNormConfig, LinearConfig, LinearInit, PrecisionPolicy,
};

/// Non-head-split self-attention across all `H * W` grid positions.
#[derive(Debug)]
pub struct GridSelfAttention {
    channels: usize,
    policy: PrecisionPolicy,
    norm: GroupNorm,
    to_q: Conv1x1,
    to_k: Conv1x1,
    to_v: Conv1x1,
    proj_out: Conv1x1,
    scale: f64,
}

impl GridSelfAttention {
    pub fn new(channels: usize, device: &Device, dtype: DType) -> Result<Self> {
        let projection = |init| {
            Conv1x1::with_init(LinearConfig::new(channels, channels), init, device, dtype)
        };
        Ok(Self {
            channels,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            norm: GroupNorm::identity(GroupNormConfig::new(channels), device, dtype)?,
            to_q: projection(LinearInit::Uniform)?,
            to_k: projection(LinearInit::Uniform)?,
            to_v: projection(LinearInit::Uniform)?,
            proj_out: projection(LinearInit::Uniform)?,
            scale: (channels as f64).powf(-0.5),
        })
    }

    /// Same layer with a zero-initialised output projection, so it acts as
    /// the identity at init and training can ease it in.
    pub fn new_zero_init(channels: usize, device: &Device, dtype: DType) -> Result<Self> {
        let mut layer = Self::new(channels, device, dtype)?;
        layer.proj_out = Conv1x1::with_init(
            LinearConfig::new(channels, channels),
            LinearInit::Zeros,
            device,
            dtype,
        )?;
        Ok(layer)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// `[B, C, H, W] -> [B, C, H, W]`, residual included.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        checks::expect_bchw("grid_attention.input", x, self.channels)?;
        let (b, c, height, width) = x.dims4()?;
        let tokens = height * width;

        let normed = self.norm.forward(x, &self.policy)?;
        let q = self.to_q.forward(&normed, &self.policy)?;
        let k = self.to_k.forward(&normed, &self.policy)?;
        let v = self.to_v.forward(&normed, &self.policy)?;

        // Flatten the grid into a token axis: queries as rows, keys as
        // columns, so sim[b, i, j] scores pixel i against pixel j.
        let q = q
            .reshape((b, c, tokens))?
            .transpose(1, 2)?
            .contiguous()?
            .to_dtype(self.policy.compute())?;
        let k = k.reshape((b, c, tokens))?.to_dtype(self.policy.compute())?;
        let v = v.reshape((b, c, tokens))?.to_dtype(self.policy.compute())?;

        let sim = q.matmul(&k)?.affine(self.scale, 0.0)?;
        let probs = softmax_last_dim(&sim)?;

        // weighted[b, c, i] = sum_j v[b, c, j] * probs[b, i, j]
        let weighted = v.matmul(&probs.transpose(1, 2)?.contiguous()?)?;
        let out = weighted.reshape((b, c, height, width))?;
        let out = self
            .proj_out
            .forward(&self.policy.cast_to_storage(&out)?, &self.policy)?;
        x + out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        let a: Vec<f32> = a
            .to_dtype(DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = b
            .to_dtype(DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0f32, f32::max)
    }

    #[test]
    fn output_shape_matches_input() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (2, 64, 8, 8), &device).unwrap();
        let layer = GridSelfAttention::new(64, &device, DType::F32).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dims(), x.dims());
        assert_eq!(y.dtype(), DType::F32);
    }

    #[test]
    fn zero_init_layer_is_identity() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (1, 32, 4, 4), &device).unwrap();
        let layer = GridSelfAttention::new_zero_init(32, &device, DType::F32).unwrap();
        let y = layer.forward(&x).unwrap();
        assert!(max_abs_diff(&x, &y) < 1e-6);
    }

    #[test]
    fn uniform_values_stay_uniform_across_positions() {
        // When every pixel carries the same feature vector, attention mixes
        // identical values and the output must be constant over the grid too.
        let device = Device::Cpu;
        let pixel = Tensor::randn(0f32, 1f32, (1, 32, 1, 1), &device).unwrap();
        let x = pixel
            .broadcast_as((1, 32, 4, 4))
            .unwrap()
            .contiguous()
            .unwrap();
        let layer = GridSelfAttention::new(32, &device, DType::F32).unwrap();
        let y = layer.forward(&x).unwrap();
        let reference = y
            .narrow(2, 0, 1)
            .unwrap()
            .narrow(3, 0, 1)
            .unwrap()
            .broadcast_as((1, 32, 4, 4))
            .unwrap()
            .contiguous()
            .unwrap();
        assert!(max_abs_diff(&y, &reference) < 1e-5);
    }

    #[test]
    fn half_precision_storage_is_preserved() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (1, 32, 4, 4), &device)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let layer = GridSelfAttention::new(32, &device, DType::F16).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dtype(), DType::F16);
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (1, 16, 4, 4), &device).unwrap();
        let layer = GridSelfAttention::new(32, &device, DType::F32).unwrap();
        assert!(layer.forward(&x).is_err());
    }
}
