//! Residual stage: one residual block per stack, evaluated in stack order.
//!
//! Block `i` receives `outputs[0..i] ++ context` as its context, where
//! `outputs` are the blocks already evaluated in this stage. After `conv0`
//! the leading `i` entries (the earlier stacks) are added in; after `conv1`
//! the configured merge layer only sees the external context.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::{
    contextual::{AddLeadingContext, ContextFactory, ContextualLayer, IgnoreLeadingContext},
    conv::{default_conv_factory, ConvFactory, WeightNorm},
    init::{BiasInit, WeightInit},
    residual::{NormalizerFactory, ResBlock, ResBlockConfig, ResBlockLayers, DEFAULT_GATE_BIAS},
    spec::{LayerFactory, LayerSpec},
};

use crate::{
    error::{PixelCnnError, Result},
    kernel::{build_shift_matrix, split_kernel, validate_kernel, SpatialNdims},
    layout::StackLayout,
    shifted::shifted_conv_factory,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ResidualStageConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Full kernel size before splitting; a single entry applies to every axis.
    pub kernel_size: Vec<usize>,
    pub gated: bool,
    pub gate_bias: f64,
    pub weight_norm: WeightNorm,
    pub weight_init: WeightInit,
    pub bias_init: BiasInit,
}

impl ResidualStageConfig {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: Vec<usize>) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            gated: false,
            gate_bias: DEFAULT_GATE_BIAS,
            weight_norm: WeightNorm::None,
            weight_init: WeightInit::default(),
            bias_init: BiasInit::default(),
        }
    }
}

/// Optional sub-layers shared by every block of a stage.
#[derive(Clone)]
pub struct ResidualStageLayers {
    /// Merges external context after `conv1`, before the gate split. Gated
    /// stages therefore expect context with `2 * out_channels` channels.
    pub merge_context1: Option<ContextFactory>,
    pub activation: Option<LayerFactory>,
    pub normalizer: Option<NormalizerFactory>,
    pub dropout: LayerSpec,
    /// Block `i` seeds its dropout with `dropout_seed + i`.
    pub dropout_seed: u64,
    /// Creates the convolutions before their padding is made causal.
    pub conv: ConvFactory,
}

impl Default for ResidualStageLayers {
    fn default() -> Self {
        Self {
            merge_context1: None,
            activation: None,
            normalizer: None,
            dropout: LayerSpec::NoOp,
            dropout_seed: 0,
            conv: default_conv_factory(),
        }
    }
}

pub struct ResidualStage {
    ndims: SpatialNdims,
    blocks: Vec<ResBlock>,
    layout: Vec<StackLayout>,
}

impl ResidualStage {
    pub fn build(
        ndims: SpatialNdims,
        config: &ResidualStageConfig,
        layers: &ResidualStageLayers,
        vb: VarBuilder,
    ) -> Result<Self> {
        let kernel = validate_kernel(ndims, &config.kernel_size)?;
        let kernels = split_kernel(&kernel)?;
        let shifts = build_shift_matrix(ndims);

        log::debug!(
            "building {ndims} residual stage: {} -> {} channels, stack kernels {kernels:?}, gated {}",
            config.in_channels,
            config.out_channels,
            config.gated
        );

        let mut blocks = Vec::with_capacity(ndims.get());
        let mut layout = Vec::with_capacity(ndims.get());
        for (i, (kernel_row, shift_row)) in kernels.into_iter().zip(shifts).enumerate() {
            let mut block_config =
                ResBlockConfig::new(config.in_channels, config.out_channels, kernel_row);
            block_config.gated = config.gated;
            block_config.gate_bias = config.gate_bias;
            block_config.weight_norm = config.weight_norm;
            block_config.weight_init = config.weight_init.clone();
            block_config.bias_init = config.bias_init.clone();

            let mut block_layers =
                ResBlockLayers::with_conv(shifted_conv_factory(shift_row, layers.conv.clone()));
            if i > 0 {
                block_layers.merge_context0 = Some(Box::new(AddLeadingContext::new(i)));
            }
            block_layers.merge_context1 = layers.merge_context1.as_ref().map(|factory| {
                if i > 0 {
                    Box::new(IgnoreLeadingContext::new(factory(), i)) as Box<dyn ContextualLayer>
                } else {
                    factory()
                }
            });
            block_layers.activation = layers.activation.clone();
            block_layers.normalizer = layers.normalizer.clone();
            block_layers.dropout = layers.dropout.clone();
            block_layers.dropout_seed = layers.dropout_seed.wrapping_add(i as u64);

            let block = ResBlock::new(block_config, block_layers, vb.pp("blocks").pp(i))?;
            layout.push(StackLayout {
                convs: block.convolutions().into_iter().map(|c| c.config().clone()).collect(),
                spatial_shifts: Vec::new(),
            });
            blocks.push(block);
        }

        Ok(Self {
            ndims,
            blocks,
            layout,
        })
    }

    pub fn ndims(&self) -> SpatialNdims {
        self.ndims
    }

    pub fn blocks(&self) -> &[ResBlock] {
        &self.blocks
    }

    pub fn layout(&self) -> &[StackLayout] {
        &self.layout
    }

    pub fn set_training(&self, training: bool) {
        for block in &self.blocks {
            block.set_training(training);
        }
    }

    pub fn forward(&self, stacks: &[Tensor], context: &[Tensor]) -> Result<Vec<Tensor>> {
        if stacks.len() != self.blocks.len() {
            return Err(PixelCnnError::arity(
                "residual stage inputs",
                self.blocks.len(),
                stacks.len(),
            ));
        }
        let mut outputs: Vec<Tensor> = Vec::with_capacity(stacks.len());
        for (block, stack) in self.blocks.iter().zip(stacks) {
            let mut block_context = outputs.clone();
            block_context.extend_from_slice(context);
            outputs.push(block.forward(stack, &block_context)?);
        }
        Ok(outputs)
    }
}
