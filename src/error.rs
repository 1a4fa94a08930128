//! Engine error taxonomy.
//!
//! Every failure crossing a service boundary is classified into one of four
//! variants, which drive retry and skip behavior:
//! - `TransientIo` is retried with backoff at the unit level;
//! - `Validation` surfaces to the caller without retry;
//! - `DependencyFailure` marks dependent phases skipped;
//! - `FatalConfig` aborts the run.

use thiserror::Error;

use crate::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Retryable storage or network failure.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// Input failed structural checks; not retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A predecessor phase failed; dependents are skipped, not retried.
    #[error("dependency failed: {0}")]
    DependencyFailure(String),

    /// Programming or configuration defect; the run is aborted.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }

    /// Convert an exhausted retry budget into the failure dependents see.
    pub fn into_dependency_failure(self, context: &str) -> Self {
        match self {
            Self::DependencyFailure(_) => self,
            other => Self::DependencyFailure(format!("{context}: {other}")),
        }
    }
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        match &err {
            RepositoryError::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => {
                match code.code {
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                        Self::TransientIo(err.to_string())
                    }
                    rusqlite::ErrorCode::ConstraintViolation => Self::Validation(err.to_string()),
                    _ => Self::FatalConfig(err.to_string()),
                }
            }
            RepositoryError::Io(_) => Self::TransientIo(err.to_string()),
            RepositoryError::Serde(_) | RepositoryError::Corrupt(_) => {
                Self::Validation(err.to_string())
            }
            _ => Self::FatalConfig(err.to_string()),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::TransientIo(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(EngineError::TransientIo("net".into()).is_retryable());
        assert!(!EngineError::Validation("bad".into()).is_retryable());
        assert!(!EngineError::DependencyFailure("up".into()).is_retryable());
        assert!(!EngineError::FatalConfig("cfg".into()).is_retryable());
    }

    #[test]
    fn test_exhausted_retries_become_dependency_failure() {
        let err = EngineError::TransientIo("timeout".into());
        let converted = err.into_dependency_failure("financial_terms");
        assert!(matches!(converted, EngineError::DependencyFailure(_)));
        assert!(converted.to_string().contains("financial_terms"));
    }

    #[test]
    fn test_io_error_maps_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(EngineError::from(io).is_retryable());
    }
}
