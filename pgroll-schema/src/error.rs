//! Error types for schema reflection.

use thiserror::Error;

/// Result type alias for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors that can occur while reading or manipulating a schema model.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Database error while reading the catalog.
    #[error("catalog read error: {0}")]
    Catalog(#[from] pgroll_postgres::PgError),

    /// A named table does not exist in the model.
    #[error("table '{0}' not found")]
    TableNotFound(String),

    /// A named column does not exist on a table.
    #[error("column '{column}' not found on table '{table}'")]
    ColumnNotFound {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// An object with the same name already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Object kind ("table", "column", ...).
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// An identifier uses a reserved prefix.
    #[error("identifier '{0}' uses a reserved prefix")]
    ReservedIdentifier(String),

    /// General schema error.
    #[error("schema error: {0}")]
    Other(String),
}

impl SchemaError {
    /// Create a column-not-found error.
    pub fn column_not_found(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::ColumnNotFound {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Create an already-exists error.
    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// Create a general error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchemaError::TableNotFound("users".to_string());
        assert!(err.to_string().contains("users"));

        let err = SchemaError::column_not_found("users", "name");
        let msg = err.to_string();
        assert!(msg.contains("users"));
        assert!(msg.contains("name"));
    }
}
