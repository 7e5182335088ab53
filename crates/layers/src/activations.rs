//! Activation catalogue for convolutional stacks.
//!
//! Activations are elementwise, so they accept tensors of any rank and return
//! tensors with identical layout. Applying one at a grid position never reads
//! neighbouring positions, which keeps causal pipelines causal.
//!
//! # Built-in formulas
//!
//! * **GELU** uses the erf-based formulation `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **SiLU / Swish** computes `x * sigmoid(x)` via the fused kernel exposed by
//!   Candle.
//! * **LeakyReLU** keeps `slope * x` for negative inputs.

use std::sync::Arc;

use candle_core::{Result, Tensor};
use candle_nn::Module;
use serde::Deserialize;

use crate::LayerRef;

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// Identity function, useful for debugging or wiring custom stacks.
    Identity,
    /// Rectified linear unit.
    Relu,
    /// ReLU with a non-zero slope for negative inputs.
    LeakyRelu { slope: f64 },
    /// GeLU using the exact erf formulation.
    Gelu,
    /// Standard SiLU (a.k.a. swish) activation.
    Silu,
    /// Hyperbolic tangent.
    Tanh,
    /// Logistic sigmoid.
    Sigmoid,
}

/// Built-in activation backed by Candle kernels.
#[derive(Debug, Clone, Copy)]
pub struct Activation {
    kind: ActivationKind,
}

impl Activation {
    pub fn new(kind: ActivationKind) -> Self {
        Self { kind }
    }

    /// Returns the [`ActivationKind`] for introspection when wiring composite blocks.
    pub fn kind(&self) -> ActivationKind {
        self.kind
    }
}

impl Module for Activation {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match self.kind {
            ActivationKind::Identity => Ok(input.clone()),
            ActivationKind::Relu => input.relu(),
            ActivationKind::LeakyRelu { slope } => candle_nn::ops::leaky_relu(input, slope),
            ActivationKind::Gelu => input.gelu_erf(),
            ActivationKind::Silu => input.silu(),
            ActivationKind::Tanh => input.tanh(),
            ActivationKind::Sigmoid => candle_nn::ops::sigmoid(input),
        }
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> LayerRef {
    Arc::new(Activation::new(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn smooth_activations_hit_known_values() -> Result<()> {
        let input = Tensor::from_slice(&[-0.5f32, 0.0, 1.0], (3,), &Device::Cpu)?;
        let cases = [
            (ActivationKind::Gelu, [-0.154_268_7f32, 0.0, 0.841_344_7]),
            (ActivationKind::Silu, [-0.188_770_8, 0.0, 0.731_058_6]),
            (ActivationKind::Sigmoid, [0.377_540_7, 0.5, 0.731_058_6]),
            (ActivationKind::Tanh, [-0.462_117_2, 0.0, 0.761_594_2]),
        ];
        for (kind, expected) in cases {
            let output = builtin(kind).forward(&input)?.to_vec1::<f32>()?;
            for (got, want) in output.iter().zip(expected) {
                assert!((got - want).abs() < 1e-5, "{kind:?}: {got} vs {want}");
            }
        }
        Ok(())
    }

    #[test]
    fn leaky_relu_keeps_scaled_negatives() -> Result<()> {
        let device = Device::Cpu;
        let activation = builtin(ActivationKind::LeakyRelu { slope: 0.1 });
        let input = Tensor::from_slice(&[-2.0f32, 0.0, 3.0], (3,), &device)?;
        let output = activation.forward(&input)?.to_vec1::<f32>()?;
        assert!((output[0] + 0.2).abs() < 1e-6);
        assert_eq!(output[1], 0.0);
        assert_eq!(output[2], 3.0);
        Ok(())
    }

    #[test]
    fn activations_preserve_four_dimensional_layout() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::randn(0f32, 1.0, (2, 3, 4, 5), &device)?;
        for kind in [
            ActivationKind::Identity,
            ActivationKind::Relu,
            ActivationKind::Silu,
            ActivationKind::Tanh,
            ActivationKind::Sigmoid,
        ] {
            let out = Activation::new(kind).forward(&input)?;
            assert_eq!(out.dims(), input.dims());
            assert_eq!(out.dtype(), DType::F32);
        }
        Ok(())
    }
}
