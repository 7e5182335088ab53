//! Input stage: fans a single tensor out into one tensor per causal stack.
//!
//! Stack `i` sums `i + 1` branches. Branch `j` is a shifted convolution using
//! kernel row `j` and shift row `j`, followed by a spatial shift of one step
//! along axis `j`. The convolution already sees the current position on its
//! causal axes; the trailing shift pushes that back by one so a stack never
//! sees the position it is computed for.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::{Module, VarBuilder};
use layers::{
    conv::{default_conv_factory, ConvConfig, ConvFactory, ConvNd, WeightNorm},
    init::{BiasInit, WeightInit},
    LayerRef,
};

use crate::{
    branch::{AddOnesChannel, BranchAndAdd},
    error::{PixelCnnError, Result},
    kernel::{build_shift_matrix, split_kernel, validate_kernel, SpatialNdims},
    layout::StackLayout,
    shifted::{build_shifted_conv, SpatialShift},
};

#[derive(Debug, Clone, PartialEq)]
pub struct InputStageConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Full kernel size before splitting; a single entry applies to every axis.
    pub kernel_size: Vec<usize>,
    /// Concatenates a constant channel of ones before the convolutions, so
    /// the zero padding can be told apart from real zeros.
    pub add_ones_channel: bool,
    pub weight_norm: WeightNorm,
    pub weight_init: WeightInit,
    pub bias_init: BiasInit,
}

impl InputStageConfig {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: Vec<usize>) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            add_ones_channel: true,
            weight_norm: WeightNorm::None,
            weight_init: WeightInit::default(),
            bias_init: BiasInit::default(),
        }
    }
}

/// A shifted convolution followed by a one-step spatial shift.
struct ShiftedBranch {
    conv: ConvNd,
    shift: SpatialShift,
}

impl Module for ShiftedBranch {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        let hidden = self.conv.forward(input)?;
        self.shift.forward(&hidden)
    }
}

pub struct InputStage {
    ndims: SpatialNdims,
    config: InputStageConfig,
    add_ones: Option<AddOnesChannel>,
    stacks: Vec<BranchAndAdd>,
    layout: Vec<StackLayout>,
}

impl InputStage {
    pub fn build(ndims: SpatialNdims, config: InputStageConfig, vb: VarBuilder) -> Result<Self> {
        Self::build_with(ndims, config, &default_conv_factory(), vb)
    }

    /// Builds the stage with `base` creating every convolution.
    pub fn build_with(
        ndims: SpatialNdims,
        config: InputStageConfig,
        base: &ConvFactory,
        vb: VarBuilder,
    ) -> Result<Self> {
        let kernel = validate_kernel(ndims, &config.kernel_size)?;
        let kernels = split_kernel(&kernel)?;
        let shifts = build_shift_matrix(ndims);
        let in_channels = config.in_channels + usize::from(config.add_ones_channel);

        log::debug!(
            "building {ndims} input stage: {in_channels} -> {} channels, stack kernels {kernels:?}",
            config.out_channels
        );

        let n = ndims.get();
        let mut stacks = Vec::with_capacity(n);
        let mut layout = Vec::with_capacity(n);
        for i in 0..n {
            let stack_vb = vb.pp("stacks").pp(i);
            let mut branches: Vec<LayerRef> = Vec::with_capacity(i + 1);
            let mut stack_layout = StackLayout {
                convs: Vec::with_capacity(i + 1),
                spatial_shifts: Vec::with_capacity(i + 1),
            };
            for j in 0..=i {
                let mut conv_config =
                    ConvConfig::new(in_channels, config.out_channels, kernels[j].clone());
                conv_config.weight_norm = config.weight_norm;
                conv_config.weight_init = config.weight_init.clone();
                conv_config.bias_init = config.bias_init.clone();

                let conv = build_shifted_conv(
                    &conv_config,
                    &shifts[j],
                    base,
                    stack_vb.pp("branches").pp(j),
                )?;
                let shift = SpatialShift::unit(n, j);
                stack_layout.convs.push(conv.config().clone());
                stack_layout.spatial_shifts.push(shift.shift().to_vec());
                branches.push(Arc::new(ShiftedBranch { conv, shift }));
            }
            stacks.push(BranchAndAdd::new(branches)?);
            layout.push(stack_layout);
        }

        Ok(Self {
            ndims,
            add_ones: config.add_ones_channel.then_some(AddOnesChannel),
            config,
            stacks,
            layout,
        })
    }

    pub fn ndims(&self) -> SpatialNdims {
        self.ndims
    }

    pub fn config(&self) -> &InputStageConfig {
        &self.config
    }

    pub fn layout(&self) -> &[StackLayout] {
        &self.layout
    }

    /// Returns one tensor per stack, each shaped `(batch, out_channels, *spatial)`.
    pub fn forward(&self, input: &Tensor) -> Result<Vec<Tensor>> {
        if input.rank() != self.ndims.input_rank() {
            return Err(PixelCnnError::RankMismatch {
                expected: self.ndims.input_rank(),
                actual: input.rank(),
            });
        }
        let input = match &self.add_ones {
            Some(layer) => layer.forward(input)?,
            None => input.clone(),
        };
        self.stacks.iter().map(|stack| stack.forward(&input)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn two_dimensional_layout() -> Result<()> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let stage = InputStage::build(SpatialNdims::D2, InputStageConfig::new(1, 4, vec![3]), vb)?;
        let layout = stage.layout();
        assert_eq!(layout.len(), 2);

        assert_eq!(layout[0].kernel_sizes(), vec![&[2usize, 3][..]]);
        assert_eq!(layout[0].paddings(), vec![&[(1usize, 0usize), (1, 1)][..]]);
        assert_eq!(layout[0].spatial_shifts, vec![vec![1, 0]]);

        assert_eq!(layout[1].kernel_sizes(), vec![&[2usize, 3][..], &[2, 2][..]]);
        assert_eq!(layout[1].paddings()[1], &[(1, 0), (1, 0)][..]);
        assert_eq!(layout[1].spatial_shifts, vec![vec![1, 0], vec![0, 1]]);
        assert!(layout.iter().flat_map(|s| &s.convs).all(|c| c.in_channels == 2));
        Ok(())
    }

    #[test]
    fn outputs_one_tensor_per_stack() -> Result<()> {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut config = InputStageConfig::new(2, 3, vec![3, 5, 3]);
        config.add_ones_channel = false;
        let stage = InputStage::build(SpatialNdims::D3, config, vb)?;

        let input = Tensor::randn(0f32, 1.0, (1, 2, 3, 4, 5), &device)?;
        let stacks = stage.forward(&input)?;
        assert_eq!(stacks.len(), 3);
        for stack in &stacks {
            assert_eq!(stack.dims(), &[1, 3, 3, 4, 5]);
        }
        Ok(())
    }

    #[test]
    fn wrong_rank_is_reported() -> Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let stage = InputStage::build(SpatialNdims::D2, InputStageConfig::new(1, 2, vec![3]), vb)?;
        let input = Tensor::zeros((1, 1, 4), DType::F32, &device)?;
        assert!(matches!(
            stage.forward(&input),
            Err(PixelCnnError::RankMismatch {
                expected: 4,
                actual: 3
            })
        ));
        Ok(())
    }

    #[test]
    fn even_kernel_is_rejected() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let built = InputStage::build(SpatialNdims::D1, InputStageConfig::new(1, 2, vec![4]), vb);
        assert!(matches!(built, Err(PixelCnnError::InvalidKernel { .. })));
    }
}
