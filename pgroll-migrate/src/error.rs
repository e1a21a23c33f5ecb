//! Error types for the migration engine.

use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database operation error.
    #[error("database error: {0}")]
    Postgres(#[from] pgroll_postgres::PgError),

    /// Schema reflection error.
    #[error("schema error: {0}")]
    Schema(#[from] pgroll_schema::SchemaError),

    /// JSON (de)serialization error for migration documents.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The state schema has not been initialized.
    #[error("engine state not initialized; run init first")]
    NotInitialized,

    /// The state schema was created by a newer engine.
    #[error("state schema was initialized by a newer engine (found version {found}, this engine supports {supported})")]
    AlreadyInitializedWithNewerVersion {
        /// Version found in the state schema.
        found: i32,
        /// Version this engine writes.
        supported: i32,
    },

    /// Another migration is already in progress for the schema.
    #[error("migration '{name}' is already in progress for schema '{schema}'")]
    ActiveMigrationExists {
        /// Logical schema name.
        schema: String,
        /// Name of the in-progress migration.
        name: String,
    },

    /// No migration is in progress.
    #[error("no migration is in progress for schema '{0}'")]
    NoActiveMigration(String),

    /// A migration with this name already exists in history.
    #[error("migration '{0}' already exists in history")]
    MigrationExists(String),

    /// The migration's declared parent does not match the current head.
    #[error("parent mismatch: migration declares {declared:?}, current head is {head:?}")]
    ParentMismatch {
        /// Parent the migration declares.
        declared: Option<String>,
        /// Current head of the history.
        head: Option<String>,
    },

    /// One or more operations failed validation.
    #[error("validation failed: {}", errors.join("; "))]
    Validation {
        /// All validation errors, in operation order.
        errors: Vec<String>,
    },

    /// A DDL phase failed for one operation.
    #[error("operation '{operation}' failed during {phase}: {source}")]
    Phase {
        /// Operation name.
        operation: String,
        /// Phase that failed ("start", "complete", "rollback").
        phase: &'static str,
        /// Underlying error.
        #[source]
        source: Box<MigrationError>,
    },

    /// The backfill for a table failed.
    #[error("backfill of table '{table}' failed: {source}")]
    Backfill {
        /// Table being backfilled.
        table: String,
        /// Underlying error.
        #[source]
        source: Box<MigrationError>,
    },

    /// The driving context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Rollback finished but some operations could not be reverted.
    #[error("rollback incomplete: {}", errors.join("; "))]
    RollbackIncomplete {
        /// Per-operation failures, in the order encountered.
        errors: Vec<String>,
    },

    /// The catalog is not in the state the engine expects.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl MigrationError {
    /// Create a single-message validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            errors: vec![message.into()],
        }
    }

    /// Wrap an error as a phase failure for one operation.
    pub fn phase(operation: impl Into<String>, phase: &'static str, source: MigrationError) -> Self {
        Self::Phase {
            operation: operation.into(),
            phase,
            source: Box::new(source),
        }
    }

    /// Wrap an error as a backfill failure for one table.
    pub fn backfill(table: impl Into<String>, source: MigrationError) -> Self {
        Self::Backfill {
            table: table.into(),
            source: Box::new(source),
        }
    }

    /// Create an invariant-violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    /// Whether the error happened before any DDL ran.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized
                | Self::AlreadyInitializedWithNewerVersion { .. }
                | Self::ActiveMigrationExists { .. }
                | Self::NoActiveMigration(_)
                | Self::MigrationExists(_)
                | Self::ParentMismatch { .. }
                | Self::Validation { .. }
        )
    }

    /// Whether the error was caused by cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Phase { source, .. } | Self::Backfill { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_joins_errors() {
        let err = MigrationError::Validation {
            errors: vec!["first".to_string(), "second".to_string()],
        };
        assert_eq!(err.to_string(), "validation failed: first; second");
    }

    #[test]
    fn test_is_precondition() {
        assert!(MigrationError::NotInitialized.is_precondition());
        assert!(
            MigrationError::ParentMismatch {
                declared: None,
                head: Some("01_init".to_string()),
            }
            .is_precondition()
        );
        assert!(!MigrationError::Cancelled.is_precondition());
    }

    #[test]
    fn test_is_cancelled_unwraps_context() {
        let err = MigrationError::backfill("users", MigrationError::Cancelled);
        assert!(err.is_cancelled());
    }
}
