use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Config(String),
    #[error("search API rate limit hit (HTTP 429)")]
    RateLimited,
}

impl AppError {
    /// Transient search-API signals that warrant a single pause before the
    /// pipeline continues with the next unit of work.
    pub fn wants_backoff(&self) -> bool {
        match self {
            AppError::RateLimited => true,
            AppError::Http(err) => err.is_timeout(),
            _ => false,
        }
    }

    pub fn is_store_failure(&self) -> bool {
        matches!(self, AppError::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_as_backoff() {
        assert!(AppError::RateLimited.wants_backoff());
        assert!(!AppError::Config("missing key".into()).wants_backoff());
    }

    #[test]
    fn classifies_store_failures() {
        let err = AppError::Database(rusqlite::Error::InvalidQuery);
        assert!(err.is_store_failure());
        assert!(!err.wants_backoff());
    }
}
