//! Fan-out helpers used when a stack is fed by more than one convolution.

use candle_core::Tensor;
use candle_nn::Module;
use layers::{spec::LayerTree, LayerRef};

use crate::error::{PixelCnnError, Result};

/// Applies every branch to the same input and sums the results.
#[derive(Clone)]
pub struct BranchAndAdd {
    branches: Vec<LayerRef>,
}

impl BranchAndAdd {
    /// Nested branch lists are flattened once, in order. At least one branch is required.
    pub fn new(branches: impl Into<LayerTree<LayerRef>>) -> Result<Self> {
        let branches = branches.into().flatten();
        if branches.is_empty() {
            return Err(PixelCnnError::arity("branches", 1, 0));
        }
        Ok(Self { branches })
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut outputs = self.branches.iter().map(|branch| branch.forward(input));
        let mut total = match outputs.next() {
            Some(first) => first?,
            None => return Err(PixelCnnError::arity("branches", 1, 0)),
        };
        for output in outputs {
            total = total
                .broadcast_add(&output?)
                .map_err(PixelCnnError::ShapeMismatch)?;
        }
        Ok(total)
    }
}

/// Appends a channel of ones to a channels-first tensor.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddOnesChannel;

impl Module for AddOnesChannel {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        let mut shape = input.dims().to_vec();
        if shape.len() < 2 {
            candle_core::bail!("add_ones_channel: expected a channels-first tensor, got {shape:?}");
        }
        shape[1] = 1;
        let ones = Tensor::ones(shape, input.dtype(), input.device())?;
        Tensor::cat(&[input, &ones], 1)
    }
}
