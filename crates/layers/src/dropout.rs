//! Inverted dropout with a reproducible mask stream.
//!
//! Masks are drawn from a SplitMix64 sequence keyed by a seed and an atomic
//! position counter, so a layer shared between threads needs no lock and two
//! layers built with the same seed drop the same elements. Kept values are
//! scaled by `1 / (1 - p)` while training; at inference the layer is the
//! identity.

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use candle_core::{Result, Tensor};
use candle_nn::Module;

const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

fn splitmix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Uniform sample in `[0, 1)` for position `index` of the stream keyed by `seed`.
fn uniform(seed: u64, index: u64) -> f32 {
    let bits = splitmix64(seed.wrapping_add(index.wrapping_mul(GOLDEN_GAMMA))) >> 40;
    bits as f32 / (1u64 << 24) as f32
}

pub struct Dropout {
    probability: f32,
    seed: u64,
    /// Number of mask elements drawn so far.
    drawn: AtomicU64,
    training: AtomicBool,
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability)
            .field("seed", &self.seed)
            .field("training", &self.is_training())
            .finish()
    }
}

impl Dropout {
    /// Creates a layer in training mode. `probability <= 0` never drops,
    /// `probability >= 1` drops everything.
    pub fn new(probability: f32, seed: u64) -> Self {
        Self {
            probability,
            seed,
            drawn: AtomicU64::new(0),
            training: AtomicBool::new(true),
        }
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }
}

impl Module for Dropout {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if !self.is_training() || self.probability <= 0.0 {
            return Ok(input.clone());
        }
        if self.probability >= 1.0 {
            return input.zeros_like();
        }
        let keep = 1.0 - self.probability;
        let count = input.elem_count();
        let start = self.drawn.fetch_add(count as u64, Ordering::Relaxed);
        let mask: Vec<f32> = (0..count as u64)
            .map(|i| if uniform(self.seed, start + i) < keep { 1.0 / keep } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(mask, input.dims(), input.device())?.to_dtype(input.dtype())?;
        input.mul(&mask)
    }
}
