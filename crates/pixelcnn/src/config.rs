//! File-based network configuration.
//!
//! A configuration is read from TOML (or JSON, chosen by the `.json`
//! extension) and validated as a whole: every problem found is reported in a
//! single [`PixelCnnError::Validation`].
//!
//! ```toml
//! spatial_ndims = 2
//! in_channels = 3
//! hidden_channels = 64
//! kernel_size = 5
//! num_stages = 4
//! activation = { leaky_relu = { slope = 0.1 } }
//! normalizer = "layer_norm"
//! dropout = 0.1
//! weight_norm = "full"
//! gated = true
//! merge_context = "add"
//! ```
//!
//! With `gated = true` the context passed to [`crate::PixelCnn::forward`]
//! must carry `2 * hidden_channels` channels.

use std::{fs, path::Path};

use layers::{
    activations::ActivationKind, contextual::ContextMergeKind, conv::WeightNorm, norm::NormKind,
    residual::DEFAULT_GATE_BIAS,
};
use serde::Deserialize;

use crate::{
    error::{PixelCnnError, Result},
    kernel::{validate_kernel, SpatialNdims},
};

/// Kernel size given either once for every axis or per axis.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum KernelSize {
    Uniform(usize),
    PerAxis(Vec<usize>),
}

impl KernelSize {
    pub fn as_vec(&self) -> Vec<usize> {
        match self {
            KernelSize::Uniform(k) => vec![*k],
            KernelSize::PerAxis(ks) => ks.clone(),
        }
    }
}

impl Default for KernelSize {
    fn default() -> Self {
        KernelSize::Uniform(3)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PixelCnnConfig {
    pub spatial_ndims: SpatialNdims,
    pub in_channels: usize,
    pub hidden_channels: usize,
    pub kernel_size: KernelSize,
    pub add_ones_channel: bool,
    pub num_stages: usize,
    pub activation: Option<ActivationKind>,
    pub normalizer: Option<NormKind>,
    /// Dropout probability between the two convolutions of every block.
    pub dropout: Option<f64>,
    pub dropout_seed: u64,
    pub weight_norm: WeightNorm,
    pub gated: bool,
    pub gate_bias: f64,
    /// How external context is merged after the second convolution of every block.
    /// That convolution emits `2 * hidden_channels` when `gated` is set, so the
    /// context tensors must have that width too.
    pub merge_context: Option<ContextMergeKind>,
}

impl Default for PixelCnnConfig {
    fn default() -> Self {
        Self {
            spatial_ndims: SpatialNdims::D2,
            in_channels: 1,
            hidden_channels: 32,
            kernel_size: KernelSize::default(),
            add_ones_channel: true,
            num_stages: 1,
            activation: None,
            normalizer: None,
            dropout: None,
            dropout_seed: 0,
            weight_norm: WeightNorm::None,
            gated: false,
            gate_bias: DEFAULT_GATE_BIAS,
            merge_context: None,
        }
    }
}

impl PixelCnnConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: PixelCnnConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(PixelCnnError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        log::debug!("loaded pixelcnn config from {}", path.display());
        Ok(config)
    }

    /// Full kernel size with a single entry broadcast to every axis.
    pub fn kernel(&self) -> Result<Vec<usize>> {
        validate_kernel(self.spatial_ndims, &self.kernel_size.as_vec())
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.in_channels == 0 {
            errors.push("in_channels must be greater than zero".to_string());
        }
        if self.hidden_channels == 0 {
            errors.push("hidden_channels must be greater than zero".to_string());
        }
        if let Err(err) = self.kernel() {
            errors.push(format!("kernel_size: {err}"));
        }
        if let Some(p) = self.dropout {
            if !(0.0..1.0).contains(&p) {
                errors.push(format!("dropout must be in [0, 1), got {p}"));
            }
        }
        if !self.gate_bias.is_finite() {
            errors.push(format!("gate_bias must be finite, got {}", self.gate_bias));
        }
        if let Some(ActivationKind::LeakyRelu { slope }) = self.activation {
            if !slope.is_finite() {
                errors.push(format!("leaky_relu slope must be finite, got {slope}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PixelCnnError::Validation(errors))
        }
    }
}
