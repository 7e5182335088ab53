//! The assembled network: input stage, residual stages, output stage.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::{
    residual::{activation_factory, channel_normalizer},
    spec::{LayerSpec, LayerTree},
};

use crate::{
    config::{KernelSize, PixelCnnConfig},
    error::{PixelCnnError, Result},
    input::{InputStage, InputStageConfig},
    kernel::SpatialNdims,
    layout::StackLayout,
    output::OutputStage,
    stage::{ResidualStage, ResidualStageConfig, ResidualStageLayers},
};

/// A PixelCNN over one, two or three spatial axes.
///
/// The output at every position depends only on input positions strictly
/// before it in raster order, plus the external context passed to
/// [`PixelCnn::forward`].
pub struct PixelCnn {
    ndims: SpatialNdims,
    input: InputStage,
    stages: Vec<ResidualStage>,
    output: OutputStage,
}

impl PixelCnn {
    /// Composes pre-built stages. Nested stage lists are flattened in order.
    pub fn new(
        ndims: SpatialNdims,
        input: InputStage,
        stages: impl Into<LayerTree<ResidualStage>>,
    ) -> Result<Self> {
        if input.ndims() != ndims {
            return Err(PixelCnnError::TypeMismatch {
                what: "input stage",
                expected: ndims.get(),
                actual: input.ndims().get(),
            });
        }
        let stages = stages.into().flatten();
        if let Some(stage) = stages.iter().find(|s| s.ndims() != ndims) {
            return Err(PixelCnnError::TypeMismatch {
                what: "residual stage",
                expected: ndims.get(),
                actual: stage.ndims().get(),
            });
        }
        log::info!(
            "pixelcnn {ndims}: {} -> {} channels, {} residual stages",
            input.config().in_channels,
            input.config().out_channels,
            stages.len()
        );
        Ok(Self {
            ndims,
            input,
            stages,
            output: OutputStage::new(ndims),
        })
    }

    /// Builds every stage from `config`, creating parameters under the
    /// `input` and `stages.{n}` prefixes of `vb`.
    pub fn from_config(config: &PixelCnnConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let ndims = config.spatial_ndims;
        let kernel = config.kernel()?;

        let mut input_config =
            InputStageConfig::new(config.in_channels, config.hidden_channels, kernel.clone());
        input_config.add_ones_channel = config.add_ones_channel;
        input_config.weight_norm = config.weight_norm;
        let input = InputStage::build(ndims, input_config, vb.pp("input"))?;

        let mut stage_config =
            ResidualStageConfig::new(config.hidden_channels, config.hidden_channels, kernel);
        stage_config.gated = config.gated;
        stage_config.gate_bias = config.gate_bias;
        stage_config.weight_norm = config.weight_norm;

        let stages_vb = vb.pp("stages");
        let mut stages = Vec::with_capacity(config.num_stages);
        for n in 0..config.num_stages {
            let layers = ResidualStageLayers {
                merge_context1: config.merge_context.map(|kind| kind.factory()),
                activation: config.activation.map(activation_factory),
                normalizer: config.normalizer.map(channel_normalizer),
                dropout: LayerSpec::from(config.dropout),
                dropout_seed: config
                    .dropout_seed
                    .wrapping_add((n * ndims.get()) as u64),
                ..Default::default()
            };
            stages.push(ResidualStage::build(ndims, &stage_config, &layers, stages_vb.pp(n))?);
        }

        Self::new(ndims, input, stages)
    }

    pub fn ndims(&self) -> SpatialNdims {
        self.ndims
    }

    pub fn input_stage(&self) -> &InputStage {
        &self.input
    }

    pub fn stages(&self) -> &[ResidualStage] {
        &self.stages
    }

    /// Layouts of the input stage followed by each residual stage.
    pub fn layout(&self) -> Vec<Vec<StackLayout>> {
        std::iter::once(self.input.layout().to_vec())
            .chain(self.stages.iter().map(|s| s.layout().to_vec()))
            .collect()
    }

    /// Switches dropout in every residual block between training and inference.
    pub fn set_training(&self, training: bool) {
        for stage in &self.stages {
            stage.set_training(training);
        }
    }

    /// `context` is merged after the second convolution of every block, so
    /// gated stages expect it at twice their hidden width.
    pub fn forward(&self, input: &Tensor, context: &[Tensor]) -> Result<Tensor> {
        let mut stacks = self.input.forward(input)?;
        for stage in &self.stages {
            stacks = stage.forward(&stacks, context)?;
        }
        self.output.forward(&stacks)
    }
}

fn with_arity(
    ndims: SpatialNdims,
    in_channels: usize,
    hidden_channels: usize,
    kernel_size: usize,
    num_stages: usize,
    vb: VarBuilder,
) -> Result<PixelCnn> {
    let config = PixelCnnConfig {
        spatial_ndims: ndims,
        in_channels,
        hidden_channels,
        kernel_size: KernelSize::Uniform(kernel_size),
        num_stages,
        ..Default::default()
    };
    PixelCnn::from_config(&config, vb)
}

/// A 1-d network with default settings otherwise.
pub fn pixelcnn_1d(
    in_channels: usize,
    hidden_channels: usize,
    kernel_size: usize,
    num_stages: usize,
    vb: VarBuilder,
) -> Result<PixelCnn> {
    with_arity(SpatialNdims::D1, in_channels, hidden_channels, kernel_size, num_stages, vb)
}

/// A 2-d network with default settings otherwise.
pub fn pixelcnn_2d(
    in_channels: usize,
    hidden_channels: usize,
    kernel_size: usize,
    num_stages: usize,
    vb: VarBuilder,
) -> Result<PixelCnn> {
    with_arity(SpatialNdims::D2, in_channels, hidden_channels, kernel_size, num_stages, vb)
}

/// A 3-d network with default settings otherwise.
pub fn pixelcnn_3d(
    in_channels: usize,
    hidden_channels: usize,
    kernel_size: usize,
    num_stages: usize,
    vb: VarBuilder,
) -> Result<PixelCnn> {
    with_arity(SpatialNdims::D3, in_channels, hidden_channels, kernel_size, num_stages, vb)
}
