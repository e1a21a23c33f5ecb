//! Error types for PostgreSQL operations.

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Error, Debug)]
pub enum PgError {
    /// Connection pool error.
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// PostgreSQL error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// The retry budget for a transient failure was exhausted.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The last transient error observed.
        #[source]
        source: Box<PgError>,
    },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PgError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Get the SQLSTATE code of the underlying driver error, if any.
    pub fn sql_state(&self) -> Option<&SqlState> {
        match self {
            Self::Postgres(e) => e.code(),
            Self::Pool(deadpool_postgres::PoolError::Backend(e)) => e.code(),
            Self::RetriesExhausted { source, .. } => source.sql_state(),
            _ => None,
        }
    }

    /// Whether re-issuing the failed transaction is reasonable.
    ///
    /// True for serialization failures, deadlocks, and dropped connections.
    pub fn is_retryable(&self) -> bool {
        if let Self::Postgres(e) = self
            && e.is_closed()
        {
            return true;
        }
        if let Self::Pool(deadpool_postgres::PoolError::Backend(e)) = self
            && e.is_closed()
        {
            return true;
        }
        if let Self::Connection(_) = self {
            return true;
        }
        matches!(
            self.sql_state(),
            Some(&SqlState::T_R_SERIALIZATION_FAILURE) | Some(&SqlState::T_R_DEADLOCK_DETECTED)
        )
    }

    /// Whether the error is a `lock_timeout` expiry (SQLSTATE 55P03).
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self.sql_state(), Some(&SqlState::LOCK_NOT_AVAILABLE))
    }

    /// Whether the error is a connection-level failure.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Pool(_) | Self::Connection(_) => true,
            Self::Postgres(e) => e.is_closed(),
            _ => false,
        }
    }
}
