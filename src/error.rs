//! Error types for the local store, the remote API, repositories and the
//! sync engine.
//!
//! Transport and decode failures are caught and logged inside the sync core;
//! only repository-level failures (and 401s) travel up to the UI layer, which
//! shows `RepositoryError::user_message()` in a banner.

use std::path::PathBuf;

use thiserror::Error;

/// Failures of the on-device SQLite cache.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open local store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to prepare store directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("migration v{version} failed: {source}")]
    Migration {
        version: i32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("local store lock poisoned")]
    LockPoisoned,

    #[error("stored value in column `{column}` is unreadable: {value}")]
    Corrupt { column: &'static str, value: String },

    #[error("unknown column `{column}` for table `{table}`")]
    UnknownColumn {
        table: &'static str,
        column: &'static str,
    },
}

/// Failures talking to the repair shop REST API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("You appear to be offline")]
    Offline,

    #[error("The request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Your session has expired. Please log in again.")]
    Unauthorized,

    #[error("You don't have permission to access this resource")]
    Forbidden,

    #[error("The requested resource was not found")]
    NotFound,

    #[error("Too many requests. Please try again later.")]
    RateLimited { retry_after: Option<u64> },

    #[error("{message} (HTTP {status})")]
    Validation { status: u16, message: String },

    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Unexpected response (HTTP {status}): {message}")]
    Http { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Worth trying again on a later cycle without changing the payload.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Offline
                | ApiError::Timeout
                | ApiError::Transport(_)
                | ApiError::RateLimited { .. }
                | ApiError::Server { .. }
        )
    }

    /// The server rejected the payload itself; resending it unchanged will
    /// fail the same way.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ApiError::Validation { .. } | ApiError::NotFound | ApiError::Forbidden
        )
    }

    pub fn requires_reauth(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }

    /// Connectivity is gone, so further calls in the same phase are pointless.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ApiError::Offline | ApiError::Timeout | ApiError::Transport(_)
        )
    }
}

/// Errors surfaced by repositories to the UI layer.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Item not found")]
    NotFound,

    #[error("Failed to save changes: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] ApiError),

    #[error("{0}")]
    Sync(String),
}

impl RepositoryError {
    /// Displayable message for the UI error banner.
    pub fn user_message(&self) -> String {
        match self {
            RepositoryError::NotFound => "Item not found".to_string(),
            RepositoryError::Store(_) => "Failed to save changes".to_string(),
            RepositoryError::Remote(e) => e.to_string(),
            RepositoryError::Sync(message) => message.clone(),
        }
    }
}

impl From<SyncError> for RepositoryError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Unauthorized => RepositoryError::Remote(ApiError::Unauthorized),
            SyncError::Api(e) => RepositoryError::Remote(e),
            SyncError::Store(e) => RepositoryError::Store(e),
            other @ SyncError::PushFailed { .. } => RepositoryError::Sync(other.to_string()),
        }
    }
}

/// Errors that end a sync cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Your session has expired. Please log in again.")]
    Unauthorized,

    #[error("{failed} local change(s) failed to sync: {first_error}")]
    PushFailed { failed: usize, first_error: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Api(ApiError),
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized => SyncError::Unauthorized,
            other => SyncError::Api(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_classification() {
        let validation = ApiError::Validation {
            status: 422,
            message: "status is invalid".into(),
        };
        assert!(validation.is_permanent());
        assert!(!validation.is_retryable());

        let server = ApiError::Server {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(!server.is_permanent());
        assert!(server.is_retryable());

        assert!(ApiError::Timeout.is_connectivity());
        assert!(ApiError::Unauthorized.requires_reauth());
        assert!(!ApiError::RateLimited { retry_after: None }.is_permanent());
    }

    #[test]
    fn test_unauthorized_maps_to_dedicated_sync_error() {
        assert!(matches!(
            SyncError::from(ApiError::Unauthorized),
            SyncError::Unauthorized
        ));
        assert!(matches!(
            SyncError::from(ApiError::Timeout),
            SyncError::Api(ApiError::Timeout)
        ));
    }

    #[test]
    fn test_repository_user_message() {
        assert_eq!(RepositoryError::NotFound.user_message(), "Item not found");
        assert_eq!(
            RepositoryError::Remote(ApiError::Offline).user_message(),
            "You appear to be offline"
        );
        assert_eq!(
            RepositoryError::Store(StoreError::LockPoisoned).user_message(),
            "Failed to save changes"
        );
    }
}
