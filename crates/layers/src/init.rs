//! Weight initialisation policies for convolution kernels.
//!
//! Policies mirror common recipes (Glorot, Kaiming, scaled variants). Fan-in
//! and fan-out follow the convolution convention `channels * prod(kernel)`.
//! Each policy resolves to a [`candle_nn::Init`] hint so parameters are created
//! through a [`candle_nn::VarBuilder`] and stay trainable when it is backed by
//! a `VarMap`.

use candle_nn::Init;
use serde::Deserialize;

/// Supported weight initialisation policies.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Kaiming/He uniform initialisation.
    KaimingUniform { negative_slope: f64 },
    /// Kaiming/He normal initialisation.
    KaimingNormal { negative_slope: f64 },
    /// Every element set to the same value.
    Const(f64),
    /// Scales another policy to support deep network stabilisation.
    Scaled { base: Box<WeightInit>, scale: f64 },
}

impl Default for WeightInit {
    fn default() -> Self {
        WeightInit::KaimingNormal {
            negative_slope: 0.0,
        }
    }
}

impl WeightInit {
    /// Convenience helper to scale an existing policy.
    pub fn scaled(base: WeightInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    /// Resolves the policy for a kernel with the given fan-in and fan-out.
    pub fn resolve(&self, fan_in: usize, fan_out: usize) -> Init {
        let (fan_in, fan_out) = (fan_in.max(1) as f64, fan_out.max(1) as f64);
        match self {
            WeightInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
            WeightInit::XavierNormal => Init::Randn {
                mean: 0.0,
                stdev: (2.0f64 / (fan_in + fan_out)).sqrt(),
            },
            WeightInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = 3.0f64.sqrt() * gain / fan_in.sqrt();
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
            WeightInit::KaimingNormal { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                Init::Randn {
                    mean: 0.0,
                    stdev: gain / fan_in.sqrt(),
                }
            }
            WeightInit::Const(value) => Init::Const(*value),
            WeightInit::Scaled { base, scale } => {
                match base.resolve(fan_in as usize, fan_out as usize) {
                    Init::Uniform { lo, up } => Init::Uniform {
                        lo: lo * scale,
                        up: up * scale,
                    },
                    Init::Randn { mean, stdev } => Init::Randn {
                        mean: mean * scale,
                        stdev: stdev * scale,
                    },
                    Init::Const(value) => Init::Const(value * scale),
                    other => other,
                }
            }
        }
    }
}

/// Bias initialiser applied to convolution biases.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasInit {
    Zeros,
    Const(f64),
}

impl Default for BiasInit {
    fn default() -> Self {
        BiasInit::Zeros
    }
}

impl BiasInit {
    pub fn resolve(&self) -> Init {
        match self {
            BiasInit::Zeros => Init::Const(0.0),
            BiasInit::Const(value) => Init::Const(*value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xavier_uniform_bound_uses_both_fans() {
        match WeightInit::XavierUniform.resolve(18, 36) {
            Init::Uniform { lo, up } => {
                let expected = (6.0f64 / 54.0).sqrt();
                assert!((up - expected).abs() < 1e-12);
                assert!((lo + expected).abs() < 1e-12);
            }
            other => panic!("unexpected init {other:?}"),
        }
    }

    #[test]
    fn scaled_kaiming_shrinks_stdev() {
        let base = WeightInit::KaimingNormal {
            negative_slope: 0.0,
        };
        let plain = base.resolve(64, 64);
        let scaled = WeightInit::scaled(base, 0.5).resolve(64, 64);
        match (plain, scaled) {
            (Init::Randn { stdev: a, .. }, Init::Randn { stdev: b, .. }) => {
                assert!((b - 0.5 * a).abs() < 1e-12);
                assert!((a - (2.0f64 / 64.0).sqrt()).abs() < 1e-12);
            }
            other => panic!("unexpected inits {other:?}"),
        }
    }
}
