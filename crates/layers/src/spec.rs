//! Construction-time descriptions of optional layers and nested layer lists.
//!
//! Optional sub-layers are configured with a [`LayerSpec`] and resolved once
//! when the owning block is built. Lists of layers may be supplied as a
//! [`LayerTree`] and are flattened once into construction order.

use std::{fmt, sync::Arc};

use candle_core::Result;

use crate::LayerRef;

/// Zero-argument constructor for a single-input layer.
pub type LayerFactory = Arc<dyn Fn() -> Result<LayerRef> + Send + Sync>;

/// An optional sub-layer: absent, given by a literal value, or built by a factory.
#[derive(Clone, Default)]
pub enum LayerSpec {
    #[default]
    NoOp,
    /// A numeric shorthand interpreted by the owner (a dropout probability, say).
    Literal(f64),
    Factory(LayerFactory),
}

impl fmt::Debug for LayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerSpec::NoOp => f.write_str("NoOp"),
            LayerSpec::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            LayerSpec::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

impl LayerSpec {
    /// Resolves into a layer; `literal` decides what a literal value builds.
    pub fn resolve<F>(&self, literal: F) -> Result<Option<LayerRef>>
    where
        F: FnOnce(f64) -> Result<LayerRef>,
    {
        match self {
            LayerSpec::NoOp => Ok(None),
            LayerSpec::Literal(value) => literal(*value).map(Some),
            LayerSpec::Factory(factory) => factory().map(Some),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, LayerSpec::NoOp)
    }
}

impl From<Option<f64>> for LayerSpec {
    fn from(value: Option<f64>) -> Self {
        value.map(LayerSpec::Literal).unwrap_or_default()
    }
}

/// A possibly nested list of items.
#[derive(Debug, Clone)]
pub enum LayerTree<T> {
    Leaf(T),
    Nested(Vec<LayerTree<T>>),
}

impl<T> LayerTree<T> {
    /// Flattens the tree depth-first, keeping left-to-right order.
    pub fn flatten(self) -> Vec<T> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(self, out: &mut Vec<T>) {
        match self {
            LayerTree::Leaf(item) => out.push(item),
            LayerTree::Nested(children) => {
                for child in children {
                    child.flatten_into(out);
                }
            }
        }
    }
}

impl<T> From<Vec<T>> for LayerTree<T> {
    fn from(items: Vec<T>) -> Self {
        LayerTree::Nested(items.into_iter().map(LayerTree::Leaf).collect())
    }
}
