//! Channel normalisation layers for channel-first convolutional tensors.
//!
//! Inputs follow the `(batch, channels, *spatial)` convention. Statistics are
//! computed along the channel axis only, independently at every grid position,
//! so a normaliser never mixes information between positions. Batch or
//! spatial statistics would let later positions leak into earlier ones.

use candle_core::{DType, Error, Result, Tensor};
use candle_nn::{Init, Module, VarBuilder};
use serde::Deserialize;

use crate::checks;

/// Available normalisation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum NormKind {
    /// Mean/variance normalisation across channels with affine scale and bias.
    LayerNorm,
    /// Root-mean-square normalisation across channels with affine scale.
    RmsNorm,
}

/// Configuration shared by all normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Number of channels being normalised.
    pub channels: usize,
    /// Numeric stabiliser applied to variance or RMS computations.
    pub epsilon: f64,
    pub kind: NormKind,
}

impl NormConfig {
    pub fn new(channels: usize, kind: NormKind) -> Self {
        Self {
            channels,
            epsilon: 1e-5,
            kind,
        }
    }
}

/// Per-position normalisation across the channel axis.
#[derive(Debug, Clone)]
pub struct ChannelNorm {
    config: NormConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl ChannelNorm {
    /// Constructs the layer from explicit parameters of shape `(channels,)`.
    pub fn new(config: NormConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if matches!(config.kind, NormKind::RmsNorm) && bias.is_some() {
            return Err(Error::Msg("RMSNorm does not support bias parameters".into()));
        }
        if matches!(config.kind, NormKind::LayerNorm) && bias.is_none() {
            return Err(Error::Msg("LayerNorm requires a bias parameter".into()));
        }
        let allowed = [DType::F16, DType::BF16, DType::F32, DType::F64];
        checks::expect_shape("norm.weight", &weight, &[config.channels])?;
        checks::expect_dtype_in("norm.weight", &weight, &allowed)?;
        if let Some(bias) = &bias {
            checks::expect_shape("norm.bias", bias, &[config.channels])?;
            checks::expect_dtype_in("norm.bias", bias, &allowed)?;
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Creates the parameters through `vb` (scale initialised to one, bias to zero).
    pub fn load(config: NormConfig, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(config.channels, "weight", Init::Const(1.0))?;
        let bias = match config.kind {
            NormKind::LayerNorm => {
                Some(vb.get_with_hints(config.channels, "bias", Init::Const(0.0))?)
            }
            NormKind::RmsNorm => None,
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    fn broadcast_shape(&self, rank: usize) -> Vec<usize> {
        let mut shape = vec![1; rank];
        shape[1] = self.config.channels;
        shape
    }
}

impl Module for ChannelNorm {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let rank = input.rank();
        if rank < 3 {
            return Err(Error::Msg(format!(
                "norm.input: expected (batch, channels, *spatial), got {:?}",
                input.dims()
            )));
        }
        checks::expect_channels_first("norm.input", input, self.config.channels, rank - 2)?;

        let mut centered = input.clone();
        if matches!(self.config.kind, NormKind::LayerNorm) {
            let mean = input.mean_keepdim(1)?;
            centered = centered.broadcast_sub(&mean)?;
        }
        let variance = centered.sqr()?.mean_keepdim(1)?;
        let denom = variance.affine(1.0, self.config.epsilon)?.sqrt()?;
        let normalized = centered.broadcast_div(&denom)?;

        let shape = self.broadcast_shape(rank);
        let weight = self.weight.to_dtype(input.dtype())?.reshape(shape.clone())?;
        let mut output = normalized.broadcast_mul(&weight)?;
        if let Some(bias) = &self.bias {
            let bias = bias.to_dtype(input.dtype())?.reshape(shape)?;
            output = output.broadcast_add(&bias)?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()
    }

    #[test]
    fn layer_norm_matches_last_axis_reference_after_transpose() -> Result<()> {
        let device = Device::Cpu;
        let config = NormConfig::new(4, NormKind::LayerNorm);
        let weight = Tensor::from_vec(vec![1.0f32, 0.5, -0.25, 1.5], (4,), &device)?;
        let bias = Tensor::from_vec(vec![0.1f32, -0.2, 0.05, 0.0], (4,), &device)?;
        let layer = ChannelNorm::new(config.clone(), weight.clone(), Some(bias.clone()))?;

        let input = Tensor::randn(0f32, 1.0, (2, 4, 3, 3), &device)?;
        let output = layer.forward(&input)?;
        assert_eq!(output.dims(), input.dims());

        let last = input.permute((0, 2, 3, 1))?.contiguous()?;
        let reference = candle_nn::ops::layer_norm(&last, &weight, &bias, config.epsilon as f32)?
            .permute((0, 3, 1, 2))?;
        assert!(max_diff(&output, &reference)? < 5e-4);
        Ok(())
    }

    #[test]
    fn rms_norm_rejects_bias_and_normalises_per_position() -> Result<()> {
        let device = Device::Cpu;
        let config = NormConfig::new(2, NormKind::RmsNorm);
        let ones = Tensor::ones(2, DType::F32, &device)?;
        assert!(ChannelNorm::new(config.clone(), ones.clone(), Some(ones.clone())).is_err());

        let layer = ChannelNorm::new(config, ones, None)?;
        // Two positions with very different magnitudes end up at unit RMS each.
        let input = Tensor::from_vec(vec![3.0f32, 300.0, 4.0, 400.0], (1, 2, 2), &device)?;
        let output = layer.forward(&input)?.to_vec3::<f32>()?;
        let rms_first = ((output[0][0][0].powi(2) + output[0][1][0].powi(2)) / 2.0).sqrt();
        let rms_second = ((output[0][0][1].powi(2) + output[0][1][1].powi(2)) / 2.0).sqrt();
        assert!((rms_first - 1.0).abs() < 1e-3);
        assert!((rms_second - 1.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn load_initialises_identity_affine() -> Result<()> {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = ChannelNorm::load(NormConfig::new(3, NormKind::LayerNorm), vb.pp("norm"))?;
        assert_eq!(layer.weight.to_vec1::<f32>()?, vec![1.0, 1.0, 1.0]);
        assert_eq!(varmap.all_vars().len(), 2);
        Ok(())
    }
}
