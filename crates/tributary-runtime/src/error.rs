//! Error types for stores, configuration and operators

use std::path::PathBuf;

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O or storage error
    #[error("I/O error: {0}")]
    Io(String),

    /// State could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Changelog contents are unreadable beyond a torn trailing frame
    #[error("Corrupt changelog {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// No store was registered under the requested name
    #[error("Unknown store: {0}")]
    UnknownStore(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Setup-time configuration errors. Always fatal, never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required parameter '{parameter}' for {operator}")]
    MissingParameter {
        operator: &'static str,
        parameter: &'static str,
    },

    #[error("Invalid parameter '{parameter}' for {operator}: {reason}")]
    InvalidParameter {
        operator: &'static str,
        parameter: &'static str,
        reason: String,
    },

    #[error("Store name '{0}' is already registered")]
    DuplicateStoreName(String),

    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to open store: {0}")]
    Store(#[from] StoreError),
}

/// Data-path errors raised while an operator processes a record.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Operator '{0}' used before init")]
    NotInitialized(String),

    #[error("Expression '{expression}' received a null value for field '{field}'")]
    NullField { expression: String, field: String },

    #[error("Expression '{expression}' expected a {expected} value for field '{field}', got {actual}")]
    TypeMismatch {
        expression: String,
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// NaN or infinity reached a value that would be persisted
    #[error("Expression '{expression}' hit a non-finite number for field '{field}'")]
    NonFinite { expression: String, field: String },
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type OperatorResult<T> = Result<T, OperatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_parameter_message() {
        let err = ConfigError::MissingParameter {
            operator: "windowed join",
            parameter: "retention",
        };
        assert_eq!(
            err.to_string(),
            "Missing required parameter 'retention' for windowed join"
        );
    }

    #[test]
    fn test_store_error_converts_into_operator_error() {
        let err: OperatorError = StoreError::Io("disk gone".into()).into();
        assert!(matches!(err, OperatorError::Store(StoreError::Io(_))));
        assert_eq!(err.to_string(), "I/O error: disk gone");
    }
}
