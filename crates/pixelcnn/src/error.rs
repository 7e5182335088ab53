use thiserror::Error;

pub type Result<T, E = PixelCnnError> = std::result::Result<T, E>;

/// Errors raised while building or evaluating a PixelCNN network.
///
/// Every variant reports a contract violation or a runtime failure; none of
/// them is retried or corrected internally.
#[derive(Error, Debug)]
pub enum PixelCnnError {
    #[error("invalid kernel size {kernel_size:?}: {reason}")]
    InvalidKernel {
        kernel_size: Vec<usize>,
        reason: String,
    },

    #[error("input is expected to be {expected}d, got a rank {actual} tensor")]
    RankMismatch { expected: usize, actual: usize },

    #[error("{what}: expected {expected} entries, got {actual}")]
    ArityMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("branch outputs are not broadcast compatible: {0}")]
    ShapeMismatch(#[source] candle_core::Error),

    #[error("{what} must be {expected}-d, got a {actual}-d one")]
    TypeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl PixelCnnError {
    pub(crate) fn invalid_kernel(kernel_size: &[usize], reason: impl Into<String>) -> Self {
        Self::InvalidKernel {
            kernel_size: kernel_size.to_vec(),
            reason: reason.into(),
        }
    }

    pub(crate) fn arity(what: &'static str, expected: usize, actual: usize) -> Self {
        Self::ArityMismatch {
            what,
            expected,
            actual,
        }
    }
}

impl From<toml::de::Error> for PixelCnnError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigFormat(err.to_string())
    }
}

impl From<serde_json::Error> for PixelCnnError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigFormat(err.to_string())
    }
}
