//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be
//! wired into constructors or forward paths. They return
//! `candle_core::Result<()>` so call sites can propagate errors without
//! panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor has the expected rank.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let dims = tensor.dims();
    if dims.len() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected rank {rank}, got shape {dims:?}"
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Validates the `(batch, tokens, channels)` convention with a known channel
/// count.
pub fn expect_batch_tokens_channels(name: &str, tensor: &Tensor, channels: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual] if *actual == channels => Ok(()),
        dims => Err(Error::Msg(format!(
            "{name}: expected (batch, tokens, {channels}) layout, got {dims:?}"
        ))),
    }
}

/// Validates the `(batch, channels, height, width)` grid convention.
pub fn expect_bchw(name: &str, tensor: &Tensor, channels: usize) -> Result<()> {
    match tensor.dims() {
        [_, actual, _, _] if *actual == channels => Ok(()),
        dims => Err(Error::Msg(format!(
            "{name}: expected (batch, {channels}, height, width) layout, got {dims:?}"
        ))),
    }
}
