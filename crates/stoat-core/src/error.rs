use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within Stoat.
///
/// Shape and parameter validation happens eagerly — at descriptor
/// construction and at kernel entry — so malformed configurations fail
/// before any compute resources are committed. Backend execution failures
/// surface as [`Error::Device`] and are never retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed layer parameters: a derived output dimension came out
    /// non-positive, or padding swallows the whole filter extent.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// A tensor's shape does not match what the descriptor or operation expects.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between tensors in one operation.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Element count mismatch when creating a tensor from host data.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix product dimension mismatch.
    #[error("dot shape mismatch: [{m}x{k1}] @ [{k2}x{n}] — inner dims must match")]
    DotShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Backend-internal allocation or execution failure. Fatal; not retried.
    #[error("device error: {0}")]
    Device(String),

    /// Requested operation or dtype combination is not implemented.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn invalid_shape(s: impl Into<String>) -> Self {
        Error::InvalidShape(s.into())
    }

    pub fn device(s: impl Into<String>) -> Self {
        Error::Device(s.into())
    }

    pub fn unsupported(s: impl Into<String>) -> Self {
        Error::Unsupported(s.into())
    }
}

/// Convenience Result type used throughout Stoat.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
