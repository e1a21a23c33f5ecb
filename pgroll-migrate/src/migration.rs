//! Migration documents and history records.

use chrono::{DateTime, Utc};
use pgroll_schema::Schema;
use serde::{Deserialize, Serialize};

use crate::operations::Op;

/// One logical schema change: a named, ordered list of operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    /// Unique name, e.g. `02_add_full_name`.
    pub name: String,
    /// Expected parent migration. When set, `start` refuses to run unless
    /// this matches the current head of the history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Operations, applied in order.
    #[serde(default)]
    pub operations: Vec<Op>,
}

impl Migration {
    /// Create a migration with the given operations.
    pub fn new(name: impl Into<String>, operations: Vec<Op>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            operations,
        }
    }

    /// Declare the expected parent.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Whether the migration carries no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Parse a migration from its JSON document.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Serialize the migration to its JSON document.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Lifecycle state of a migration in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// `start` has run; the old and new versions coexist.
    InProgress,
    /// `complete` has run; this is (or was) a head of the history.
    Complete,
    /// `rollback` has run; the migration left no trace in the schema.
    RolledBack,
}

impl MigrationState {
    /// Whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// One row of the persisted migration history.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    /// Migration name.
    pub name: String,
    /// Parent migration name; `None` for the first migration.
    pub parent: Option<String>,
    /// The migration document as provided to `start`.
    pub migration: Migration,
    /// Lifecycle state.
    pub state: MigrationState,
    /// The reflected schema after completion; `None` until complete.
    pub resulting_schema: Option<Schema>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last updated.
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    /// Whether the migration is still in progress.
    pub fn is_active(&self) -> bool {
        self.state == MigrationState::InProgress
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_migration_json_round_trip() {
        let json = r#"{
            "name": "01_create_users",
            "operations": [
                {
                    "kind": "create_table",
                    "name": "users",
                    "columns": [
                        {"name": "id", "type": "integer", "pk": true},
                        {"name": "name", "type": "varchar(255)", "unique": true}
                    ]
                }
            ]
        }"#;

        let migration = Migration::from_json(json).unwrap();
        assert_eq!(migration.name, "01_create_users");
        assert_eq!(migration.operations.len(), 1);

        let serialized = migration.to_json().unwrap();
        let reparsed = Migration::from_json(&serialized).unwrap();
        assert_eq!(reparsed.name, migration.name);
        assert_eq!(reparsed.operations.len(), 1);
    }

    #[test]
    fn test_migration_parent_defaults_to_none() {
        let migration = Migration::from_json(r#"{"name": "01_init", "operations": []}"#).unwrap();
        assert_eq!(migration.parent, None);
        assert!(migration.is_empty());

        let migration = migration.with_parent("00_baseline");
        assert_eq!(migration.parent.as_deref(), Some("00_baseline"));
    }

    #[test]
    fn test_state_terminality() {
        assert!(!MigrationState::InProgress.is_terminal());
        assert!(MigrationState::Complete.is_terminal());
        assert!(MigrationState::RolledBack.is_terminal());
    }

    #[test]
    fn test_unknown_operation_kind_is_rejected() {
        let json = r#"{
            "name": "01_bad",
            "operations": [{"kind": "frobnicate", "table": "users"}]
        }"#;
        assert!(Migration::from_json(json).is_err());
    }
}
