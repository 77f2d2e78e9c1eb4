//! Error types for the AMTL system

use thiserror::Error;

/// Main error type for AMTL operations
#[derive(Error, Debug)]
pub enum Error {
    /// Unrecognized architecture, gate version, or otherwise invalid settings.
    /// Always fatal for a training run.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A weight tensor received no gradient during the inner step.
    /// Non-fatal: the tensor keeps its value for the current iteration.
    #[error("Gradient unavailable for parameter `{param}`")]
    GradientUnavailable {
        /// Identifier of the parameter that was skipped
        param: String,
    },

    /// Model wiring error (missing parameter, shape mismatch)
    #[error("Model error: {0}")]
    Model(String),

    /// Data loading or collation error
    #[error("Data error: {0}")]
    Data(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for AMTL operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a gradient-unavailable diagnostic
    pub fn gradient_unavailable(param: impl std::fmt::Display) -> Self {
        Self::GradientUnavailable {
            param: param.to_string(),
        }
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error must abort a training run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::GradientUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_unavailable_is_not_fatal() {
        let err = Error::gradient_unavailable("hidden.task0.weight");
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Gradient unavailable for parameter `hidden.task0.weight`"
        );
    }

    #[test]
    fn test_config_error_is_fatal() {
        let err = Error::config("No correct version parameter!");
        assert!(err.is_fatal());
        assert!(err.to_string().starts_with("Configuration error"));
    }
}
