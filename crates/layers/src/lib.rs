//! Building blocks for convolutional networks assembled from Candle primitives.
//!
//! Tensors follow the channel-first `(batch, channels, *spatial)` layout with
//! one to three spatial axes. Single-input layers implement
//! [`candle_nn::Module`]; layers that also consume a list of context tensors
//! implement [`contextual::ContextualLayer`].

pub mod activations;
pub mod checks;
pub mod contextual;
pub mod conv;
pub mod dropout;
pub mod init;
pub mod norm;
pub mod residual;
pub mod spec;

use std::sync::Arc;

/// Shared handle to a single-input layer.
pub type LayerRef = Arc<dyn candle_nn::Module + Send + Sync>;
