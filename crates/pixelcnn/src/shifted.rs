//! Convolutions padded to look backwards, and the spatial shift that follows
//! them in the input stage.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::{Module, VarBuilder};
use layers::{
    checks,
    conv::{ConvConfig, ConvFactory, ConvNd},
};

use crate::error::{PixelCnnError, Result};

/// Per-axis `(before, after)` padding for a shifted convolution.
///
/// With `t = (k - 1) * d` total padding, a causal axis gets `(t, 0)` so every
/// output only sees the current and earlier positions; any other axis gets
/// `(t / 2, t - t / 2)`.
pub fn causal_padding(shift: &[bool], kernel_size: &[usize], dilation: &[usize]) -> Vec<(usize, usize)> {
    shift
        .iter()
        .zip(kernel_size)
        .zip(dilation)
        .map(|((&causal, &k), &d)| {
            let total = k.saturating_sub(1) * d;
            if causal {
                (total, 0)
            } else {
                (total / 2, total - total / 2)
            }
        })
        .collect()
}

fn broadcast(what: &'static str, values: &[usize], ndims: usize) -> Result<Vec<usize>> {
    checks::expand_per_axis(what, values, ndims)
        .map_err(|_| PixelCnnError::arity(what, ndims, values.len()))
}

/// Rewrites `config` so its padding follows `shift`. Padding already present
/// in `config` is discarded. Single-entry kernel size, stride and dilation
/// are broadcast to every axis.
pub fn shifted_config(config: &ConvConfig, shift: &[bool]) -> Result<ConvConfig> {
    let ndims = shift.len();
    let mut shifted = config.clone();
    shifted.kernel_size = broadcast("kernel_size", &config.kernel_size, ndims)?;
    shifted.dilation = broadcast("dilation", &config.dilation, ndims)?;
    shifted.stride = broadcast("stride", &config.stride, ndims)?;
    shifted.padding = causal_padding(shift, &shifted.kernel_size, &shifted.dilation);
    Ok(shifted)
}

/// Builds one shifted convolution through `base`.
pub fn build_shifted_conv(
    config: &ConvConfig,
    shift: &[bool],
    base: &ConvFactory,
    vb: VarBuilder,
) -> Result<ConvNd> {
    let shifted = shifted_config(config, shift)?;
    Ok(base(&shifted, vb)?)
}

/// Wraps `base` so every convolution it builds is padded according to `shift`.
pub fn shifted_conv_factory(shift: Vec<bool>, base: ConvFactory) -> ConvFactory {
    Arc::new(move |config: &ConvConfig, vb: VarBuilder| {
        build_shifted_conv(config, &shift, &base, vb).map_err(candle_core::Error::wrap)
    })
}

/// Moves every spatial axis forward by a fixed offset, zero-filling the
/// leading entries and dropping the trailing ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialShift {
    shift: Vec<usize>,
}

impl SpatialShift {
    pub fn new(shift: Vec<usize>) -> Self {
        Self { shift }
    }

    /// Shift of one along `axis` and zero elsewhere.
    pub fn unit(ndims: usize, axis: usize) -> Self {
        let mut shift = vec![0; ndims];
        shift[axis] = 1;
        Self { shift }
    }

    pub fn shift(&self) -> &[usize] {
        &self.shift
    }
}

impl Module for SpatialShift {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        checks::expect_rank("spatial_shift.input", input, self.shift.len() + 2)?;
        let mut output = input.clone();
        for (axis, &offset) in self.shift.iter().enumerate() {
            if offset == 0 {
                continue;
            }
            let dim = axis + 2;
            let len = output.dim(dim)?;
            output = if offset >= len {
                output.zeros_like()?
            } else {
                output.narrow(dim, 0, len - offset)?.pad_with_zeros(dim, offset, 0)?
            };
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use layers::conv::default_conv_factory;

    #[test]
    fn padding_follows_the_shift_flags() {
        assert_eq!(
            causal_padding(&[true, false], &[2, 3], &[1, 1]),
            vec![(1, 0), (1, 1)]
        );
        assert_eq!(causal_padding(&[false], &[4], &[1]), vec![(1, 2)]);
        assert_eq!(causal_padding(&[true], &[3], &[2]), vec![(4, 0)]);
    }

    #[test]
    fn caller_padding_is_overridden_and_sizes_broadcast() -> Result<()> {
        let mut config = ConvConfig::new(2, 4, vec![3]);
        config.dilation = vec![1];
        config.stride = vec![1];
        config.padding = vec![(7, 7)];
        let shifted = shifted_config(&config, &[true, true, false])?;
        assert_eq!(shifted.kernel_size, vec![3, 3, 3]);
        assert_eq!(shifted.padding, vec![(2, 0), (2, 0), (1, 1)]);
        Ok(())
    }

    #[test]
    fn mismatched_kernel_length_is_an_arity_error() {
        let config = ConvConfig::new(1, 1, vec![3, 3]);
        let err = shifted_config(&config, &[true, false, false]).unwrap_err();
        assert!(matches!(
            err,
            PixelCnnError::ArityMismatch {
                expected: 3,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn shifted_convs_preserve_spatial_size() -> Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let input = Tensor::zeros((1, 2, 5, 6), DType::F32, &device)?;
        for shift in [[false, false], [true, false], [true, true], [false, true]] {
            for kernel in [vec![2, 3], vec![3, 3], vec![2, 2]] {
                let conv = build_shifted_conv(
                    &ConvConfig::new(2, 3, kernel),
                    &shift,
                    &default_conv_factory(),
                    vb.clone(),
                )?;
                assert_eq!(conv.forward(&input)?.dims(), &[1, 3, 5, 6]);
            }
        }
        Ok(())
    }

    #[test]
    fn spatial_shift_zero_fills_the_front() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::arange(1f32, 7.0, &device)?.reshape((1, 1, 2, 3))?;

        let rows = SpatialShift::unit(2, 0).forward(&input)?;
        assert_eq!(
            rows.flatten_all()?.to_vec1::<f32>()?,
            vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0]
        );

        let cols = SpatialShift::unit(2, 1).forward(&input)?;
        assert_eq!(
            cols.flatten_all()?.to_vec1::<f32>()?,
            vec![0.0, 1.0, 2.0, 0.0, 4.0, 5.0]
        );

        let past_end = SpatialShift::new(vec![0, 5]).forward(&input)?;
        assert_eq!(past_end.sum_all()?.to_vec0::<f32>()?, 0.0);
        Ok(())
    }
}
