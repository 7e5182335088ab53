//! Kernel and shift splitting for the causal stacks.
//!
//! A network over `D` spatial axes keeps `D` parallel stacks. Stack `i` is
//! causal along axes `0..=i`: its kernel is halved (rounded up) on those axes
//! and its padding only looks backwards there. The remaining axes keep the
//! full kernel and are padded symmetrically.

use std::fmt;

use layers::checks;
use serde::Deserialize;

use crate::error::{PixelCnnError, Result};

/// Per-stack kernel sizes; row `i` is the kernel used by stack `i`.
pub type StackKernelMatrix = Vec<Vec<usize>>;

/// Per-stack causal flags; row `i`, column `j` is true when stack `i` pads axis `j` backwards.
pub type ShiftMatrix = Vec<Vec<bool>>;

/// Number of spatial axes a network operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "usize")]
pub enum SpatialNdims {
    D1,
    #[default]
    D2,
    D3,
}

impl SpatialNdims {
    pub fn get(self) -> usize {
        match self {
            SpatialNdims::D1 => 1,
            SpatialNdims::D2 => 2,
            SpatialNdims::D3 => 3,
        }
    }

    /// Rank of the tensors a network of this arity consumes: batch, channel and spatial axes.
    pub fn input_rank(self) -> usize {
        self.get() + 2
    }
}

impl TryFrom<usize> for SpatialNdims {
    type Error = PixelCnnError;

    fn try_from(value: usize) -> Result<Self> {
        match value {
            1 => Ok(SpatialNdims::D1),
            2 => Ok(SpatialNdims::D2),
            3 => Ok(SpatialNdims::D3),
            other => Err(PixelCnnError::Validation(vec![format!(
                "spatial_ndims must be 1, 2 or 3, got {other}"
            )])),
        }
    }
}

impl fmt::Display for SpatialNdims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d", self.get())
    }
}

/// Broadcasts a single kernel size to every axis and checks that each entry
/// is odd and at least 3.
pub fn validate_kernel(ndims: SpatialNdims, kernel_size: &[usize]) -> Result<Vec<usize>> {
    let kernel = checks::expand_per_axis("kernel_size", kernel_size, ndims.get())
        .map_err(|err| PixelCnnError::invalid_kernel(kernel_size, err.to_string()))?;
    check_entries(&kernel)?;
    Ok(kernel)
}

fn check_entries(kernel_size: &[usize]) -> Result<()> {
    if kernel_size.is_empty() || kernel_size.len() > 3 {
        return Err(PixelCnnError::invalid_kernel(
            kernel_size,
            "expected 1 to 3 spatial axes",
        ));
    }
    if kernel_size.iter().any(|&k| k < 3) {
        return Err(PixelCnnError::invalid_kernel(
            kernel_size,
            "every entry must be at least 3",
        ));
    }
    if kernel_size.iter().any(|&k| k % 2 != 1) {
        return Err(PixelCnnError::invalid_kernel(kernel_size, "every entry must be odd"));
    }
    Ok(())
}

/// Splits the full kernel into one kernel per stack.
///
/// Entry `(i, j)` is `ceil(k_j / 2)` when `j <= i` and `k_j` otherwise.
pub fn split_kernel(full_kernel: &[usize]) -> Result<StackKernelMatrix> {
    check_entries(full_kernel)?;
    let ndims = full_kernel.len();
    Ok((0..ndims)
        .map(|i| {
            full_kernel
                .iter()
                .enumerate()
                .map(|(j, &k)| if j <= i { (k + 1) / 2 } else { k })
                .collect()
        })
        .collect())
}

/// Row `i` is `true` on the first `i + 1` axes and `false` afterwards.
pub fn build_shift_matrix(ndims: SpatialNdims) -> ShiftMatrix {
    let n = ndims.get();
    (0..n).map(|i| (0..n).map(|j| j <= i).collect()).collect()
}
