//! Layers that merge an input with a list of context tensors.
//!
//! Context tensors are expected to broadcast against the input. A residual
//! block applies these after its convolutions to inject conditioning or, in
//! causal stacks, the outputs of stacks that were already computed.

use std::sync::Arc;

use candle_core::{Error, Result, Tensor};
use serde::Deserialize;

/// A layer taking an input plus an ordered list of context tensors.
pub trait ContextualLayer: Send + Sync {
    fn forward(&self, input: &Tensor, context: &[Tensor]) -> Result<Tensor>;
}

/// Creates a fresh contextual layer each time it is called.
pub type ContextFactory = Arc<dyn Fn() -> Box<dyn ContextualLayer> + Send + Sync>;

/// Returns the input unchanged, ignoring any context.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreContext;

impl ContextualLayer for IgnoreContext {
    fn forward(&self, input: &Tensor, _context: &[Tensor]) -> Result<Tensor> {
        Ok(input.clone())
    }
}

/// Adds every context tensor to the input.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddContext;

impl ContextualLayer for AddContext {
    fn forward(&self, input: &Tensor, context: &[Tensor]) -> Result<Tensor> {
        context
            .iter()
            .try_fold(input.clone(), |acc, t| acc.broadcast_add(t))
    }
}

/// Multiplies the input by every context tensor.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiplyContext;

impl ContextualLayer for MultiplyContext {
    fn forward(&self, input: &Tensor, context: &[Tensor]) -> Result<Tensor> {
        context
            .iter()
            .try_fold(input.clone(), |acc, t| acc.broadcast_mul(t))
    }
}

/// Adds only the first `first_n` context tensors to the input.
#[derive(Debug, Clone, Copy)]
pub struct AddLeadingContext {
    first_n: usize,
}

impl AddLeadingContext {
    pub fn new(first_n: usize) -> Self {
        Self { first_n }
    }

    pub fn first_n(&self) -> usize {
        self.first_n
    }
}

impl ContextualLayer for AddLeadingContext {
    fn forward(&self, input: &Tensor, context: &[Tensor]) -> Result<Tensor> {
        let leading = context.get(..self.first_n).ok_or_else(|| {
            Error::Msg(format!(
                "leading context: expected at least {} context tensors, got {}",
                self.first_n,
                context.len()
            ))
        })?;
        leading
            .iter()
            .try_fold(input.clone(), |acc, t| acc.broadcast_add(t))
    }
}

/// Forwards to `wrapped` with the first `first_n` context tensors removed.
pub struct IgnoreLeadingContext {
    wrapped: Box<dyn ContextualLayer>,
    first_n: usize,
}

impl IgnoreLeadingContext {
    pub fn new(wrapped: Box<dyn ContextualLayer>, first_n: usize) -> Self {
        Self { wrapped, first_n }
    }

    pub fn first_n(&self) -> usize {
        self.first_n
    }
}

impl ContextualLayer for IgnoreLeadingContext {
    fn forward(&self, input: &Tensor, context: &[Tensor]) -> Result<Tensor> {
        let rest = context.get(self.first_n..).unwrap_or(&[]);
        self.wrapped.forward(input, rest)
    }
}

/// Built-in context merge strategies selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMergeKind {
    Ignore,
    Add,
    Multiply,
}

impl ContextMergeKind {
    pub fn factory(self) -> ContextFactory {
        match self {
            ContextMergeKind::Ignore => {
                Arc::new(|| Box::new(IgnoreContext) as Box<dyn ContextualLayer>)
            }
            ContextMergeKind::Add => Arc::new(|| Box::new(AddContext) as Box<dyn ContextualLayer>),
            ContextMergeKind::Multiply => {
                Arc::new(|| Box::new(MultiplyContext) as Box<dyn ContextualLayer>)
            }
        }
    }
}
