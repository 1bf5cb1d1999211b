//! Error types for latent dynamics models.

use thiserror::Error;

/// Result type for latent dynamics operations.
pub type DynamicsResult<T> = Result<T, DynamicsError>;

/// Errors raised while building, running or training the models.
#[derive(Debug, Error)]
pub enum DynamicsError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Dimensions that cannot produce a valid model
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input tensor disagrees with the model or with its sibling input
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Batch is missing a field a later stage consumes
    #[error("Batch field `{0}` is missing; label the batch with the IDM first")]
    MissingField(&'static str),

    /// Dataset could not produce a batch
    #[error("Data error: {0}")]
    Data(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DynamicsError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DynamicsError::shape_mismatch("[4, 3, 64, 64]", "[2, 3, 64, 64]");
        assert_eq!(
            err.to_string(),
            "Shape mismatch: expected [4, 3, 64, 64], got [2, 3, 64, 64]"
        );

        let err = DynamicsError::MissingField("la");
        assert!(err.to_string().contains("`la`"));
    }
}
