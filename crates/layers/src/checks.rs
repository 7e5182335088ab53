//! Lightweight validation helpers shared across layer components.
//!
//! Convolutional tensors follow the channel-first `(batch, channels, *spatial)`
//! convention. These routines return `candle_core::Result<()>` so call sites can
//! propagate errors without panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected rank {rank}, got shape {:?}",
            tensor.dims()
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

/// Validates the `(batch, channels, *spatial)` layout with a known channel count.
pub fn expect_channels_first(
    name: &str,
    tensor: &Tensor,
    channels: usize,
    spatial_ndims: usize,
) -> Result<()> {
    expect_rank(name, tensor, spatial_ndims + 2)?;
    let actual = tensor.dims()[1];
    if actual == channels {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected {channels} channels, got shape {:?}",
            tensor.dims()
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

/// Expands a per-axis size argument: a single value is broadcast to every axis.
pub fn expand_per_axis(name: &str, values: &[usize], ndims: usize) -> Result<Vec<usize>> {
    match values.len() {
        1 => Ok(vec![values[0]; ndims]),
        n if n == ndims => Ok(values.to_vec()),
        n => Err(Error::Msg(format!(
            "{name}: expected 1 or {ndims} values, got {n}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn channels_first_layout_is_checked() -> Result<()> {
        let t = Tensor::zeros((2, 3, 4, 4), DType::F32, &Device::Cpu)?;
        expect_channels_first("x", &t, 3, 2)?;
        assert!(expect_channels_first("x", &t, 4, 2).is_err());
        assert!(expect_channels_first("x", &t, 3, 1).is_err());
        Ok(())
    }

    #[test]
    fn per_axis_values_broadcast_or_pass_through() {
        assert_eq!(expand_per_axis("k", &[3], 3).unwrap(), vec![3, 3, 3]);
        assert_eq!(expand_per_axis("k", &[3, 5], 2).unwrap(), vec![3, 5]);
        assert!(expand_per_axis("k", &[3, 5], 3).is_err());
        assert!(expand_per_axis("k", &[], 2).is_err());
    }
}
