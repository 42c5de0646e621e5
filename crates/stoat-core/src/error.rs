use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within Stoat.
///
/// Every variant is a caller contract violation raised synchronously at the
/// point it is detected. Nothing here is retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A shape descriptor is malformed (negative dim, incompatible broadcast).
    #[error("invalid shape: {0}")]
    Shape(String),

    /// Variable or scope name is not allowed.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Aggregation mode string is not one of the recognized values.
    #[error(
        "invalid aggregation {got:?}: expected one of \"mean\", \"sum\", \"only_first_replica\""
    )]
    InvalidAggregation { got: String },

    /// A generator initializer was given without a shape.
    #[error("variable '{name}' uses a generator initializer and needs an explicit shape")]
    MissingShape { name: String },

    /// A shape that must be fully defined still has unknown dimensions.
    #[error("shape {shape} for '{name}' has unknown dimensions")]
    UndefinedShape { name: String, shape: String },

    /// Read of a variable that has neither storage nor initializer.
    #[error("variable '{path}' is not initialized")]
    Uninitialized { path: String },

    /// Value shape disagrees with the declared shape.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// A scope kind that must be unique was entered twice.
    #[error("a {kind} scope is already active; {kind} scopes cannot be nested")]
    NestedScope { kind: &'static str },

    /// DType mismatch between two operands.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// DType name could not be parsed.
    #[error("unknown dtype {0:?}")]
    UnknownDType(String),

    /// A restored state dict is missing a variable path.
    #[error("no entry for '{path}' in state dict")]
    MissingEntry { path: String },

    /// Operation not valid in the current variable/scope state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub(crate) fn shape(s: impl Into<String>) -> Self {
        Error::Shape(s.into())
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
