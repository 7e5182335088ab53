//! Generic convolutional residual block with context merging and gating.
//!
//! The block computes
//!
//! ```text
//! h = conv0(act(norm0(x)))          then merge_context0(h, context)
//! h = conv1(dropout(act(norm1(h)))) then merge_context1(h, context)
//! h = act(a) * sigmoid(b + gate_bias) when gated, with (a, b) = split(h)
//! y = h + shortcut(x)
//! ```
//!
//! Every convolution is produced by a caller supplied [`ConvFactory`], so the
//! block itself has no opinion on padding: a causal stack hands in factories
//! whose padding only looks backwards. The shortcut is a kernel-size-1
//! convolution, present when the channel count or stride changes (or when
//! forced), and the identity otherwise.

use std::{fmt, sync::Arc};

use candle_core::{bail, Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::{
    activations::{Activation, ActivationKind},
    contextual::ContextualLayer,
    conv::{ConvConfig, ConvFactory, ConvNd, WeightNorm},
    dropout::Dropout,
    init::{BiasInit, WeightInit},
    norm::{ChannelNorm, NormConfig, NormKind},
    spec::{LayerFactory, LayerSpec},
    LayerRef,
};

/// Default bias added to the gate before the sigmoid.
pub const DEFAULT_GATE_BIAS: f64 = 2.0;

/// Builds a normaliser for the given channel count.
pub type NormalizerFactory = Arc<dyn Fn(usize, VarBuilder) -> Result<LayerRef> + Send + Sync>;

/// Normaliser factory backed by [`ChannelNorm`].
pub fn channel_normalizer(kind: NormKind) -> NormalizerFactory {
    Arc::new(move |channels: usize, vb: VarBuilder| -> Result<LayerRef> {
        let norm = ChannelNorm::load(NormConfig::new(channels, kind), vb)?;
        Ok(Arc::new(norm) as LayerRef)
    })
}

/// Activation factory backed by the built-in catalogue.
pub fn activation_factory(kind: ActivationKind) -> LayerFactory {
    Arc::new(move || -> Result<LayerRef> { Ok(Arc::new(Activation::new(kind))) })
}

/// Shape and parameterisation of a residual block.
#[derive(Debug, Clone, PartialEq)]
pub struct ResBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: Vec<usize>,
    pub stride: usize,
    /// Forces (`Some(true)`) or forbids (`Some(false)`) the shortcut convolution.
    pub use_shortcut: Option<bool>,
    pub gated: bool,
    pub gate_bias: f64,
    pub weight_norm: WeightNorm,
    pub weight_init: WeightInit,
    pub bias_init: BiasInit,
}

impl ResBlockConfig {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: Vec<usize>) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: 1,
            use_shortcut: None,
            gated: false,
            gate_bias: DEFAULT_GATE_BIAS,
            weight_norm: WeightNorm::None,
            weight_init: WeightInit::default(),
            bias_init: BiasInit::default(),
        }
    }

    fn needs_shortcut(&self) -> bool {
        self.use_shortcut
            .unwrap_or(self.in_channels != self.out_channels || self.stride != 1)
    }

    fn conv_config(&self, in_channels: usize, out_channels: usize, kernel: Vec<usize>) -> ConvConfig {
        let mut config = ConvConfig::new(in_channels, out_channels, kernel);
        config.weight_norm = self.weight_norm;
        config.weight_init = self.weight_init.clone();
        config.bias_init = self.bias_init.clone();
        config
    }
}

/// Sub-layers plugged into a [`ResBlock`].
pub struct ResBlockLayers {
    pub shortcut: ConvFactory,
    pub conv0: ConvFactory,
    pub conv1: ConvFactory,
    pub merge_context0: Option<Box<dyn ContextualLayer>>,
    pub merge_context1: Option<Box<dyn ContextualLayer>>,
    pub activation: Option<LayerFactory>,
    pub normalizer: Option<NormalizerFactory>,
    /// `Literal(p)` builds a [`Dropout`] with probability `p`.
    pub dropout: LayerSpec,
    pub dropout_seed: u64,
}

impl ResBlockLayers {
    /// Uses `conv` for all three convolutions and leaves everything else out.
    pub fn with_conv(conv: ConvFactory) -> Self {
        Self {
            shortcut: conv.clone(),
            conv0: conv.clone(),
            conv1: conv,
            merge_context0: None,
            merge_context1: None,
            activation: None,
            normalizer: None,
            dropout: LayerSpec::NoOp,
            dropout_seed: 0,
        }
    }
}

pub struct ResBlock {
    config: ResBlockConfig,
    shortcut: Option<ConvNd>,
    norm0: Option<LayerRef>,
    activation0: Option<LayerRef>,
    conv0: ConvNd,
    merge_context0: Option<Box<dyn ContextualLayer>>,
    norm1: Option<LayerRef>,
    activation1: Option<LayerRef>,
    dropout: Option<LayerRef>,
    builtin_dropout: Option<Arc<Dropout>>,
    conv1: ConvNd,
    merge_context1: Option<Box<dyn ContextualLayer>>,
    gate_activation: Option<LayerRef>,
}

impl fmt::Debug for ResBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResBlock")
            .field("config", &self.config)
            .field("shortcut", &self.shortcut.as_ref().map(ConvNd::config))
            .field("conv0", self.conv0.config())
            .field("conv1", self.conv1.config())
            .field("merge_context0", &self.merge_context0.is_some())
            .field("merge_context1", &self.merge_context1.is_some())
            .finish()
    }
}

impl ResBlock {
    pub fn new(config: ResBlockConfig, layers: ResBlockLayers, vb: VarBuilder) -> Result<Self> {
        if config.in_channels == 0 || config.out_channels == 0 {
            bail!("resblock: channel counts must be non-zero");
        }
        if config.stride == 0 {
            bail!("resblock: stride must be positive");
        }
        let ndims = config.kernel_size.len();

        // A normaliser directly after conv0 makes its bias and scale redundant.
        let conv0_feeds_norm = layers.normalizer.is_some() && layers.dropout.is_noop();

        let shortcut = if config.needs_shortcut() {
            let mut shortcut_cfg =
                config.conv_config(config.in_channels, config.out_channels, vec![1; ndims]);
            shortcut_cfg.stride = vec![config.stride; ndims];
            Some((layers.shortcut)(&shortcut_cfg, vb.pp("shortcut"))?)
        } else {
            None
        };

        let mut conv0_cfg = config.conv_config(
            config.in_channels,
            config.out_channels,
            config.kernel_size.clone(),
        );
        conv0_cfg.stride = vec![config.stride; ndims];
        if conv0_feeds_norm {
            conv0_cfg.bias = false;
            if conv0_cfg.weight_norm == WeightNorm::Full {
                conv0_cfg.weight_norm = WeightNorm::NoScale;
            }
        }
        let conv0 = (layers.conv0)(&conv0_cfg, vb.pp("conv0"))?;

        let conv1_out = if config.gated {
            config.out_channels * 2
        } else {
            config.out_channels
        };
        let conv1_cfg =
            config.conv_config(config.out_channels, conv1_out, config.kernel_size.clone());
        let conv1 = (layers.conv1)(&conv1_cfg, vb.pp("conv1"))?;

        let (norm0, norm1) = match &layers.normalizer {
            Some(factory) => (
                Some(factory(config.in_channels, vb.pp("norm0"))?),
                Some(factory(config.out_channels, vb.pp("norm1"))?),
            ),
            None => (None, None),
        };
        let (activation0, activation1) = match &layers.activation {
            Some(factory) => (Some(factory()?), Some(factory()?)),
            None => (None, None),
        };
        let gate_activation = match (&layers.activation, config.gated) {
            (Some(factory), true) => Some(factory()?),
            _ => None,
        };

        log::debug!(
            "resblock {} -> {} kernel {:?}: shortcut {}, gated {}, normalised {}",
            config.in_channels,
            config.out_channels,
            config.kernel_size,
            shortcut.is_some(),
            config.gated,
            norm0.is_some()
        );

        let mut builtin_dropout = None;
        let seed = layers.dropout_seed;
        let dropout = layers.dropout.resolve(|p| {
            let dropout = Arc::new(Dropout::new(p as f32, seed));
            builtin_dropout = Some(dropout.clone());
            Ok(dropout as LayerRef)
        })?;

        Ok(Self {
            config,
            shortcut,
            norm0,
            activation0,
            conv0,
            merge_context0: layers.merge_context0,
            norm1,
            activation1,
            dropout,
            builtin_dropout,
            conv1,
            merge_context1: layers.merge_context1,
            gate_activation,
        })
    }

    pub fn config(&self) -> &ResBlockConfig {
        &self.config
    }

    /// Convolutions in evaluation order: shortcut (if any), conv0, conv1.
    pub fn convolutions(&self) -> Vec<&ConvNd> {
        self.shortcut
            .iter()
            .chain([&self.conv0, &self.conv1])
            .collect()
    }

    /// Toggles built-in dropout between training and inference behaviour.
    pub fn set_training(&self, training: bool) {
        if let Some(dropout) = &self.builtin_dropout {
            dropout.set_training(training);
        }
    }

    pub fn forward(&self, input: &Tensor, context: &[Tensor]) -> Result<Tensor> {
        let shortcut = match &self.shortcut {
            Some(conv) => conv.forward(input)?,
            None => input.clone(),
        };

        let mut hidden = apply(&self.norm0, input)?;
        hidden = apply(&self.activation0, &hidden)?;
        hidden = self.conv0.forward(&hidden)?;
        if let Some(merge) = &self.merge_context0 {
            hidden = merge.forward(&hidden, context)?;
        }

        hidden = apply(&self.norm1, &hidden)?;
        hidden = apply(&self.activation1, &hidden)?;
        hidden = apply(&self.dropout, &hidden)?;
        hidden = self.conv1.forward(&hidden)?;
        if let Some(merge) = &self.merge_context1 {
            hidden = merge.forward(&hidden, context)?;
        }

        if self.config.gated {
            let halves = hidden.chunk(2, 1)?;
            let gate = candle_nn::ops::sigmoid(&halves[1].affine(1.0, self.config.gate_bias)?)?;
            hidden = apply(&self.gate_activation, &halves[0])?.mul(&gate)?;
        }

        hidden.add(&shortcut)
    }
}

fn apply(layer: &Option<LayerRef>, input: &Tensor) -> Result<Tensor> {
    match layer {
        Some(layer) => layer.forward(input),
        None => Ok(input.clone()),
    }
}
