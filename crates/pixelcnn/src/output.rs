use candle_core::Tensor;

use crate::{
    error::{PixelCnnError, Result},
    kernel::SpatialNdims,
};

/// Collapses the stacks into the network output by keeping the last one,
/// which is the only stack causal along every axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputStage {
    ndims: SpatialNdims,
}

impl OutputStage {
    pub fn new(ndims: SpatialNdims) -> Self {
        Self { ndims }
    }

    pub fn ndims(&self) -> SpatialNdims {
        self.ndims
    }

    pub fn forward(&self, stacks: &[Tensor]) -> Result<Tensor> {
        match stacks {
            [.., last] if stacks.len() == self.ndims.get() => Ok(last.clone()),
            _ => Err(PixelCnnError::arity(
                "output stage inputs",
                self.ndims.get(),
                stacks.len(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn returns_the_last_stack() -> Result<()> {
        let device = Device::Cpu;
        let stacks = vec![
            Tensor::zeros((1, 1, 2, 2), DType::F32, &device)?,
            Tensor::ones((1, 1, 2, 2), DType::F32, &device)?,
        ];
        let output = OutputStage::new(SpatialNdims::D2).forward(&stacks)?;
        assert_eq!(output.sum_all()?.to_vec0::<f32>()?, 4.0);

        assert!(matches!(
            OutputStage::new(SpatialNdims::D3).forward(&stacks),
            Err(PixelCnnError::ArityMismatch {
                expected: 3,
                actual: 2,
                ..
            })
        ));
        assert!(OutputStage::new(SpatialNdims::D1).forward(&[]).is_err());
        Ok(())
    }
}
