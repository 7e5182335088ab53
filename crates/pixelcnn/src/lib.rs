//! Causal convolutional networks over 1-, 2- and 3-d grids.
//!
//! A PixelCNN keeps one stack per spatial axis. Stack `i` is causal along
//! axes `0..=i`, so the last stack at a grid position only depends on
//! positions strictly before it in raster order. The crate builds the three
//! pieces of such a network on top of the `layers` crate:
//!
//! * [`InputStage`] fans the input out into the stacks,
//! * [`ResidualStage`] runs one residual block per stack, feeding each block
//!   the outputs of the stacks evaluated before it,
//! * [`OutputStage`] keeps the last stack.
//!
//! [`PixelCnn`] composes them, either from pre-built stages or from a
//! [`PixelCnnConfig`].

pub mod branch;
pub mod config;
pub mod error;
pub mod input;
pub mod kernel;
pub mod layout;
pub mod network;
pub mod output;
pub mod shifted;
pub mod stage;

pub use branch::{AddOnesChannel, BranchAndAdd};
pub use config::{KernelSize, PixelCnnConfig};
pub use error::{PixelCnnError, Result};
pub use input::{InputStage, InputStageConfig};
pub use kernel::{build_shift_matrix, split_kernel, ShiftMatrix, SpatialNdims, StackKernelMatrix};
pub use layout::StackLayout;
pub use network::{pixelcnn_1d, pixelcnn_2d, pixelcnn_3d, PixelCnn};
pub use output::OutputStage;
pub use shifted::{build_shifted_conv, causal_padding, shifted_conv_factory, SpatialShift};
pub use stage::{ResidualStage, ResidualStageConfig, ResidualStageLayers};
