//! Error types for the deployment platform.

use thiserror::Error;

/// Main error type for the deployment platform.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Pipeline step '{step}' failed: {message}")]
    PipelineStep { step: &'static str, message: String },

    #[error("Resource allocation failed: {0}")]
    ResourceAllocation(String),

    #[error("Crypto failure: {0}")]
    Crypto(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// The small outcome set surfaced to user-facing callers.
///
/// Background pipeline and recovery errors never reach a synchronous caller;
/// they are recorded in persisted status and logs instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    BadRequest,
    Conflict,
    NotFound,
    Forbidden,
    Internal,
}

impl Error {
    /// Translate an internal error into the user-facing outcome set.
    pub fn outcome(&self) -> Outcome {
        match self {
            Error::Validation(_) | Error::Config(_) => Outcome::BadRequest,
            Error::Conflict(_) => Outcome::Conflict,
            Error::NotFound(_) => Outcome::NotFound,
            Error::Database(sqlx::Error::RowNotFound) => Outcome::NotFound,
            _ => Outcome::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_translation() {
        assert_eq!(
            Error::Validation("bad subdomain".into()).outcome(),
            Outcome::BadRequest
        );
        assert_eq!(
            Error::Conflict("subdomain taken".into()).outcome(),
            Outcome::Conflict
        );
        assert_eq!(
            Error::NotFound("project 7".into()).outcome(),
            Outcome::NotFound
        );
        assert_eq!(
            Error::Database(sqlx::Error::RowNotFound).outcome(),
            Outcome::NotFound
        );
        assert_eq!(
            Error::PipelineStep {
                step: "build",
                message: "exit 1".into()
            }
            .outcome(),
            Outcome::Internal
        );
    }
}
