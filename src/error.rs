use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyticsError {
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("attendance store unavailable: {0}")]
    TransientFetch(String),
    #[error("recompute did not finish within {0:?}")]
    Timeout(Duration),
    #[error("a report export is already in progress")]
    ExportInProgress,
    #[error("attendance store failure: {0}")]
    Store(String),
}

impl AnalyticsError {
    /// Read paths retry these automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalyticsError::TransientFetch(_))
    }

    /// The caller may re-trigger the same action and expect it to work.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AnalyticsError::TransientFetch(_)
                | AnalyticsError::Timeout(_)
                | AnalyticsError::ExportInProgress
        )
    }
}

impl From<sqlx::Error> for AnalyticsError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => AnalyticsError::NotFound("row not found".to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => AnalyticsError::TransientFetch(error.to_string()),
            other => AnalyticsError::Store(other.to_string()),
        }
    }
}

pub type AnalyticsResult<T> = Result<T, AnalyticsError>;
