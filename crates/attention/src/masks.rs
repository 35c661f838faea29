//! Boolean key-mask builders for the dense attention backend.
//!
//! Masks are `U8` tensors shaped `[batch, context_tokens]` where a non-zero
//! entry means the key participates in attention. The dense engine
//! broadcasts the mask over heads and query rows and fills masked-out
//! similarity entries with the most negative finite value of the working
//! dtype before softmax.

use candle_core::{Device, Error, Result, Tensor};

/// Builds a key mask from per-batch valid key counts: keys at positions
/// `>= length` are masked out.
pub fn key_padding_mask_from_lengths(
    device: &Device,
    lengths: &[usize],
    k_len: usize,
) -> Result<Tensor> {
    let batch = lengths.len();
    let mut data = vec![0u8; batch * k_len];
    for (b, &valid) in lengths.iter().enumerate() {
        let valid = valid.min(k_len);
        for k in 0..valid {
            data[b * k_len + k] = 1;
        }
    }
    Tensor::from_vec(data, (batch, k_len), device)
}

/// Builds a key mask from explicit boolean rows; `true` means attend. Rows
/// of differing lengths are rejected.
pub fn key_padding_mask_from_booleans(device: &Device, rows: &[Vec<bool>]) -> Result<Tensor> {
    let batch = rows.len();
    let k_len = rows.first().map(Vec::len).unwrap_or(0);
    let mut data = Vec::with_capacity(batch * k_len);
    for (b, row) in rows.iter().enumerate() {
        if row.len() != k_len {
            return Err(Error::Msg(format!(
                "mask row {b} has {} keys, expected {k_len}",
                row.len()
            )));
        }
        data.extend(row.iter().map(|&keep| u8::from(keep)));
    }
    Tensor::from_vec(data, (batch, k_len), device)
}
