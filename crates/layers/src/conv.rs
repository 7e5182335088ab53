//! N-dimensional convolution with explicit per-axis padding.
//!
//! Inputs are shaped `(batch, in_channels, *spatial)` with one to three spatial
//! axes and the output is `(batch, out_channels, *spatial_out)`. Padding is
//! given as a `(before, after)` pair per axis and applied with zeros ahead of
//! an unpadded Candle convolution, so asymmetric (causal) padding is exact.
//!
//! Candle provides 1-D and 2-D kernels. The 3-D case is evaluated as a sum of
//! 2-D convolutions, one per depth tap of the kernel, over the matching depth
//! slices of the padded input.
//!
//! Optional weight normalisation reparameterises the kernel as
//! `w = g * v / ||v||` (`Full`) or `w = v / ||v||` (`NoScale`), where the norm
//! is taken per output channel.

use std::sync::Arc;

use candle_core::{bail, Error, Result, Tensor};
use candle_nn::{Init, Module, VarBuilder};
use serde::Deserialize;

use crate::{
    checks,
    init::{BiasInit, WeightInit},
};

const WEIGHT_NORM_EPSILON: f64 = 1e-12;

/// Weight reparameterisation applied to a convolution kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightNorm {
    #[default]
    None,
    /// Normalised direction with a learnable per-channel scale.
    Full,
    /// Normalised direction only.
    NoScale,
}

/// Static description of a convolution layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: Vec<usize>,
    pub stride: Vec<usize>,
    pub dilation: Vec<usize>,
    /// `(before, after)` zero padding for each spatial axis.
    pub padding: Vec<(usize, usize)>,
    pub bias: bool,
    pub weight_norm: WeightNorm,
    pub weight_init: WeightInit,
    pub bias_init: BiasInit,
}

impl ConvConfig {
    /// Unpadded, unit-stride, undilated convolution with a bias.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: Vec<usize>) -> Self {
        let ndims = kernel_size.len();
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: vec![1; ndims],
            dilation: vec![1; ndims],
            padding: vec![(0, 0); ndims],
            bias: true,
            weight_norm: WeightNorm::None,
            weight_init: WeightInit::default(),
            bias_init: BiasInit::default(),
        }
    }

    pub fn spatial_ndims(&self) -> usize {
        self.kernel_size.len()
    }

    pub fn validate(&self) -> Result<()> {
        let ndims = self.spatial_ndims();
        if !(1..=3).contains(&ndims) {
            bail!("conv: expected 1 to 3 spatial axes, got {ndims}");
        }
        if self.in_channels == 0 || self.out_channels == 0 {
            bail!(
                "conv: channel counts must be non-zero, got {} -> {}",
                self.in_channels,
                self.out_channels
            );
        }
        if self.stride.len() != ndims || self.dilation.len() != ndims || self.padding.len() != ndims
        {
            bail!(
                "conv: kernel_size, stride, dilation and padding must all have {ndims} entries, got {}, {}, {}",
                self.stride.len(),
                self.dilation.len(),
                self.padding.len()
            );
        }
        let all_positive = |values: &[usize]| values.iter().all(|&v| v > 0);
        if !all_positive(&self.kernel_size)
            || !all_positive(&self.stride)
            || !all_positive(&self.dilation)
        {
            bail!(
                "conv: kernel_size {:?}, stride {:?} and dilation {:?} must be positive",
                self.kernel_size,
                self.stride,
                self.dilation
            );
        }
        Ok(())
    }

    fn receptive_volume(&self) -> usize {
        self.kernel_size.iter().product()
    }

    fn weight_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.out_channels, self.in_channels];
        shape.extend_from_slice(&self.kernel_size);
        shape
    }

    /// Spatial output size for the given spatial input size.
    pub fn output_size(&self, input: &[usize]) -> Result<Vec<usize>> {
        if input.len() != self.spatial_ndims() {
            bail!(
                "conv: expected {} spatial sizes, got {:?}",
                self.spatial_ndims(),
                input
            );
        }
        let mut out = Vec::with_capacity(input.len());
        for axis in 0..input.len() {
            let (before, after) = self.padding[axis];
            let padded = input[axis] + before + after;
            let span = (self.kernel_size[axis] - 1) * self.dilation[axis] + 1;
            if padded < span {
                bail!(
                    "conv: axis {axis} of size {} (padded {padded}) is smaller than the kernel span {span}",
                    input[axis]
                );
            }
            out.push((padded - span) / self.stride[axis] + 1);
        }
        Ok(out)
    }
}

/// Builds a convolution from a configuration. Used wherever a caller decides
/// the kernel layout but leaves the concrete layer to someone else.
pub type ConvFactory = Arc<dyn Fn(&ConvConfig, VarBuilder) -> Result<ConvNd> + Send + Sync>;

/// Factory creating a plain [`ConvNd`] for the configuration it receives.
pub fn default_conv_factory() -> ConvFactory {
    Arc::new(|config: &ConvConfig, vb: VarBuilder| ConvNd::new(config.clone(), vb))
}

/// Convolution over one, two or three spatial axes.
#[derive(Debug, Clone)]
pub struct ConvNd {
    config: ConvConfig,
    /// Kernel (or its direction `v` under weight normalisation).
    weight: Tensor,
    /// Per-output-channel scale `g`, only present for [`WeightNorm::Full`].
    scale: Option<Tensor>,
    bias: Option<Tensor>,
}

impl ConvNd {
    /// Creates the parameters through `vb` according to the configured initialisers.
    pub fn new(config: ConvConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let volume = config.receptive_volume();
        let init = config.weight_init.resolve(
            config.in_channels * volume,
            config.out_channels * volume,
        );
        let weight = vb.get_with_hints(config.weight_shape(), "weight", init)?;
        let scale = match config.weight_norm {
            WeightNorm::Full => {
                Some(vb.get_with_hints(config.out_channels, "scale", Init::Const(1.0))?)
            }
            _ => None,
        };
        let bias = if config.bias {
            Some(vb.get_with_hints(config.out_channels, "bias", config.bias_init.resolve())?)
        } else {
            None
        };
        Self::from_parameters(config, weight, scale, bias)
    }

    /// Wraps pre-existing parameters after validating their shapes.
    pub fn from_parameters(
        config: ConvConfig,
        weight: Tensor,
        scale: Option<Tensor>,
        bias: Option<Tensor>,
    ) -> Result<Self> {
        config.validate()?;
        checks::expect_shape("conv.weight", &weight, &config.weight_shape())?;
        match (config.weight_norm, &scale) {
            (WeightNorm::Full, Some(scale)) => {
                checks::expect_shape("conv.scale", scale, &[config.out_channels])?
            }
            (WeightNorm::Full, None) => {
                return Err(Error::Msg("full weight norm requires a scale parameter".into()))
            }
            (_, Some(_)) => {
                return Err(Error::Msg(
                    "scale parameter supplied but weight norm is not `full`".into(),
                ))
            }
            (_, None) => {}
        }
        match (config.bias, &bias) {
            (true, Some(bias)) => checks::expect_shape("conv.bias", bias, &[config.out_channels])?,
            (true, None) => return Err(Error::Msg("config expects bias but none supplied".into())),
            (false, Some(_)) => {
                return Err(Error::Msg("bias provided but config disables bias".into()))
            }
            (false, None) => {}
        }
        Ok(Self {
            config,
            weight,
            scale,
            bias,
        })
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    /// Returns the kernel actually convolved with the input.
    pub fn effective_weight(&self) -> Result<Tensor> {
        if self.config.weight_norm == WeightNorm::None {
            return Ok(self.weight.clone());
        }
        let dims = self.weight.dims().to_vec();
        let flat = self.weight.flatten_from(1)?;
        let norm = flat
            .sqr()?
            .sum_keepdim(1)?
            .affine(1.0, WEIGHT_NORM_EPSILON)?
            .sqrt()?;
        let mut direction = flat.broadcast_div(&norm)?;
        if let Some(scale) = &self.scale {
            direction = direction.broadcast_mul(&scale.reshape((self.config.out_channels, 1))?)?;
        }
        direction.reshape(dims)
    }
}

impl Module for ConvNd {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let ndims = self.config.spatial_ndims();
        checks::expect_channels_first("conv.input", input, self.config.in_channels, ndims)?;
        let out_size = self.config.output_size(&input.dims()[2..])?;

        let mut padded = input.clone();
        for (axis, &(before, after)) in self.config.padding.iter().enumerate() {
            if before > 0 || after > 0 {
                padded = padded.pad_with_zeros(axis + 2, before, after)?;
            }
        }

        let weight = self.effective_weight()?;
        let stride = &self.config.stride;
        let dilation = &self.config.dilation;
        let mut output = match ndims {
            1 => padded.conv1d(&weight, 0, stride[0], dilation[0], 1)?,
            2 => conv2d_per_axis(&padded, &weight, stride, dilation)?,
            3 => conv3d_by_depth_taps(&padded, &weight, out_size[0], stride, dilation)?,
            _ => unreachable!("validated at construction"),
        };

        if let Some(bias) = &self.bias {
            let mut shape = vec![1; ndims + 2];
            shape[1] = self.config.out_channels;
            output = output.broadcast_add(&bias.reshape(shape)?)?;
        }
        Ok(output)
    }
}

/// Inserts `dilation - 1` zeros between kernel taps along `axis`.
fn dilate_kernel(kernel: &Tensor, axis: usize, dilation: usize) -> Result<Tensor> {
    let taps = kernel.dim(axis)?;
    if dilation == 1 || taps == 1 {
        return Ok(kernel.clone());
    }
    let mut pieces = Vec::with_capacity(taps);
    for tap in 0..taps {
        let piece = kernel.narrow(axis, tap, 1)?;
        if tap + 1 < taps {
            pieces.push(piece.pad_with_zeros(axis, 0, dilation - 1)?);
        } else {
            pieces.push(piece);
        }
    }
    Tensor::cat(&pieces, axis)
}

/// Candle's `conv2d` shares one stride and dilation across both axes; unequal
/// dilations are folded into the kernel, unequal strides are rejected.
fn conv2d_per_axis(
    input: &Tensor,
    kernel: &Tensor,
    stride: &[usize],
    dilation: &[usize],
) -> Result<Tensor> {
    if stride[0] != stride[1] {
        bail!("conv: 2-D planes require equal strides, got {stride:?}");
    }
    if dilation[0] == dilation[1] {
        return input.conv2d(kernel, 0, stride[0], dilation[0], 1);
    }
    let kernel = dilate_kernel(kernel, 2, dilation[0])?;
    let kernel = dilate_kernel(&kernel, 3, dilation[1])?;
    input.conv2d(&kernel, 0, stride[0], 1, 1)
}

/// `out_depth` comes from [`ConvConfig::output_size`], which has already
/// checked that the padded depth covers the kernel span.
fn conv3d_by_depth_taps(
    input: &Tensor,
    kernel: &Tensor,
    out_depth: usize,
    stride: &[usize],
    dilation: &[usize],
) -> Result<Tensor> {
    // index_select only reads contiguous storage.
    let input = input.contiguous()?;
    let (batch, channels, _, height, width) = input.dims5()?;
    let (out_channels, _, taps, _, _) = kernel.dims5()?;

    let mut output: Option<Tensor> = None;
    for tap in 0..taps {
        let indices: Vec<u32> = (0..out_depth)
            .map(|o| (tap * dilation[0] + o * stride[0]) as u32)
            .collect();
        let indices = Tensor::from_vec(indices, out_depth, input.device())?;
        let planes = input
            .index_select(&indices, 2)?
            .permute((0, 2, 1, 3, 4))?
            .reshape((batch * out_depth, channels, height, width))?;
        let plane_kernel = kernel.narrow(2, tap, 1)?.squeeze(2)?.contiguous()?;
        let partial = conv2d_per_axis(&planes, &plane_kernel, &stride[1..], &dilation[1..])?;
        let (_, _, out_height, out_width) = partial.dims4()?;
        let partial = partial
            .reshape((batch, out_depth, out_channels, out_height, out_width))?
            .permute((0, 2, 1, 3, 4))?;
        output = Some(match output {
            None => partial,
            Some(acc) => acc.add(&partial)?,
        });
    }
    match output {
        Some(output) => output.contiguous(),
        None => bail!("conv: kernel has no depth taps"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn conv_with_weight(config: ConvConfig, weight: Tensor) -> Result<ConvNd> {
        let bias = Tensor::zeros(config.out_channels, DType::F32, weight.device())?;
        ConvNd::from_parameters(config, weight, None, Some(bias))
    }

    #[test]
    fn asymmetric_padding_keeps_length_and_only_looks_back() -> Result<()> {
        let device = Device::Cpu;
        let mut config = ConvConfig::new(1, 1, vec![3]);
        config.padding = vec![(2, 0)];
        let weight = Tensor::ones((1, 1, 3), DType::F32, &device)?;
        let conv = conv_with_weight(config, weight)?;

        let input = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0], (1, 1, 4), &device)?;
        let output = conv.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(output, vec![1.0, 3.0, 6.0, 9.0]);
        Ok(())
    }

    #[test]
    fn unequal_dilation_matches_explicit_sparse_kernel() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::randn(0f32, 1.0, (1, 2, 7, 7), &device)?;
        let weight = Tensor::randn(0f32, 1.0, (3, 2, 2, 2), &device)?;

        let mut dilated = ConvConfig::new(2, 3, vec![2, 2]);
        dilated.dilation = vec![2, 1];
        let dilated = conv_with_weight(dilated, weight.clone())?;

        // Row taps 0 and 2 of a 3x2 kernel with a zero middle row.
        let sparse = Tensor::cat(
            &[
                weight.narrow(2, 0, 1)?,
                Tensor::zeros((3, 2, 1, 2), DType::F32, &device)?,
                weight.narrow(2, 1, 1)?,
            ],
            2,
        )?;
        let reference = conv_with_weight(ConvConfig::new(2, 3, vec![3, 2]), sparse)?;

        let a = dilated.forward(&input)?;
        let b = reference.forward(&input)?;
        assert_eq!(a.dims(), &[1, 3, 5, 6]);
        let diff = a.sub(&b)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn depth_taps_match_stacked_planar_reference() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::randn(0f32, 1.0, (2, 2, 4, 3, 3), &device)?;
        let weight = Tensor::randn(0f32, 1.0, (1, 2, 2, 1, 1), &device)?;
        let conv = conv_with_weight(ConvConfig::new(2, 1, vec![2, 1, 1]), weight.clone())?;
        let output = conv.forward(&input)?;
        assert_eq!(output.dims(), &[2, 1, 3, 3, 3]);

        // A 2x1x1 kernel mixes channels of depth slices d and d + 1.
        let w = weight.flatten_all()?.to_vec1::<f32>()?;
        let x = input.to_dtype(DType::F32)?;
        let mut expected = Tensor::zeros((2, 1, 3, 3, 3), DType::F32, &device)?;
        for c in 0..2 {
            for tap in 0..2 {
                let slab = x.narrow(1, c, 1)?.narrow(2, tap, 3)?;
                expected = expected.add(&slab.affine(w[c * 2 + tap] as f64, 0.0)?)?;
            }
        }
        let diff = output
            .sub(&expected)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn depth_taps_accept_non_contiguous_input() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 1.0, (2, 2, 1, 1, 1), &device)?;
        let conv = conv_with_weight(ConvConfig::new(2, 2, vec![1, 1, 1]), weight)?;

        let input = Tensor::randn(0f32, 1.0, (1, 2, 3, 4, 4), &device)?;
        let transposed = input.transpose(3, 4)?;
        assert!(!transposed.is_contiguous());
        let strided = conv.forward(&transposed)?;
        let packed = conv.forward(&transposed.contiguous()?)?;
        assert_eq!(strided.dims(), &[1, 2, 3, 4, 4]);
        let diff = strided
            .sub(&packed)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn too_small_input_is_rejected_before_padding() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::ones((1, 1, 3, 1, 1), DType::F32, &device)?;
        let conv = conv_with_weight(ConvConfig::new(1, 1, vec![3, 1, 1]), weight)?;
        let input = Tensor::zeros((1, 1, 2, 2, 2), DType::F32, &device)?;
        assert!(conv.forward(&input).is_err());
        Ok(())
    }

    #[test]
    fn weight_norm_produces_unit_rows() -> Result<()> {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut config = ConvConfig::new(3, 4, vec![3, 3]);
        config.weight_norm = WeightNorm::NoScale;
        let conv = ConvNd::new(config, vb.pp("conv"))?;
        let norms = conv
            .effective_weight()?
            .flatten_from(1)?
            .sqr()?
            .sum(1)?
            .to_vec1::<f32>()?;
        assert!(norms.iter().all(|n| (n - 1.0).abs() < 1e-4));
        Ok(())
    }

    #[test]
    fn output_size_accounts_for_padding_and_dilation() -> Result<()> {
        let mut config = ConvConfig::new(1, 1, vec![3, 2]);
        config.dilation = vec![2, 1];
        config.padding = vec![(4, 0), (0, 1)];
        assert_eq!(config.output_size(&[5, 5])?, vec![5, 5]);
        assert!(ConvConfig::new(1, 1, vec![3]).output_size(&[2]).is_err());
        Ok(())
    }
}
