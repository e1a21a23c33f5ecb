//! The in-memory schema model.
//!
//! A [`Schema`] is the engine's picture of one database schema: tables,
//! columns, constraints, primary keys, and indexes. It is produced by the
//! reflector, evolved virtually while validating a migration, and persisted
//! as JSON alongside each completed migration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{SchemaError, SchemaResult};
use crate::reserved;

/// One database schema: a named container of tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema (namespace) name, e.g. `public`.
    pub name: String,
    /// Tables keyed by name.
    pub tables: BTreeMap<String, Table>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: BTreeMap::new(),
        }
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Look up a table by name, mutably.
    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    /// Look up a table, erroring if absent.
    pub fn require_table(&self, name: &str) -> SchemaResult<&Table> {
        self.table(name)
            .ok_or_else(|| SchemaError::TableNotFound(name.to_string()))
    }

    /// Add a table; errors if a table with the same name exists.
    pub fn add_table(&mut self, table: Table) -> SchemaResult<()> {
        if self.tables.contains_key(&table.name) {
            return Err(SchemaError::already_exists("table", &table.name));
        }
        self.tables.insert(table.name.clone(), table);
        Ok(())
    }

    /// Remove a table, returning it if present.
    pub fn remove_table(&mut self, name: &str) -> Option<Table> {
        self.tables.remove(name)
    }

    /// Rename a table.
    pub fn rename_table(&mut self, from: &str, to: &str) -> SchemaResult<()> {
        if self.tables.contains_key(to) {
            return Err(SchemaError::already_exists("table", to));
        }
        let mut table = self
            .tables
            .remove(from)
            .ok_or_else(|| SchemaError::TableNotFound(from.to_string()))?;
        table.name = to.to_string();
        self.tables.insert(to.to_string(), table);
        Ok(())
    }

    /// Table names in deterministic order.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Whether the schema has no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// One table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: String,
    /// Columns in ordinal order.
    pub columns: Vec<Column>,
    /// Primary key column names, in key order.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Secondary indexes keyed by name (the primary key index is implied).
    #[serde(default)]
    pub indexes: BTreeMap<String, Index>,
    /// Check constraints keyed by name.
    #[serde(default)]
    pub check_constraints: BTreeMap<String, CheckConstraint>,
    /// Unique constraints keyed by name.
    #[serde(default)]
    pub unique_constraints: BTreeMap<String, UniqueConstraint>,
    /// Foreign keys keyed by name.
    #[serde(default)]
    pub foreign_keys: BTreeMap<String, ForeignKey>,
    /// Table comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Table {
    /// Create an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up a column by name, mutably.
    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Look up a column, erroring if absent.
    pub fn require_column(&self, name: &str) -> SchemaResult<&Column> {
        self.column(name)
            .ok_or_else(|| SchemaError::column_not_found(&self.name, name))
    }

    /// Whether the table has a column with the given name.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Append a column; errors if one with the same name exists.
    pub fn add_column(&mut self, column: Column) -> SchemaResult<()> {
        if self.has_column(&column.name) {
            return Err(SchemaError::already_exists("column", &column.name));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Remove a column, returning it if present.
    pub fn drop_column(&mut self, name: &str) -> Option<Column> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        Some(self.columns.remove(idx))
    }

    /// Rename a column in place, updating key and index membership.
    pub fn rename_column(&mut self, from: &str, to: &str) -> SchemaResult<()> {
        if self.has_column(to) {
            return Err(SchemaError::already_exists("column", to));
        }
        let table = self.name.clone();
        let column = self
            .column_mut(from)
            .ok_or_else(|| SchemaError::column_not_found(table, from))?;
        column.name = to.to_string();

        let rename = |names: &mut Vec<String>| {
            for n in names.iter_mut() {
                if *n == from {
                    *n = to.to_string();
                }
            }
        };
        rename(&mut self.primary_key);
        for index in self.indexes.values_mut() {
            rename(&mut index.columns);
        }
        for uc in self.unique_constraints.values_mut() {
            rename(&mut uc.columns);
        }
        for fk in self.foreign_keys.values_mut() {
            rename(&mut fk.columns);
        }
        Ok(())
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// The primary key columns, in key order.
    pub fn primary_key_columns(&self) -> Vec<&Column> {
        self.primary_key
            .iter()
            .filter_map(|name| self.column(name))
            .collect()
    }

    /// A column usable as a row identity when there is no primary key: any
    /// NOT NULL column covered by a single-column unique constraint or
    /// unique index.
    pub fn unique_not_null_column(&self) -> Option<&Column> {
        let unique_single = |columns: &Vec<String>| {
            if columns.len() == 1 {
                self.column(&columns[0]).filter(|c| !c.nullable)
            } else {
                None
            }
        };
        self.unique_constraints
            .values()
            .find_map(|uc| unique_single(&uc.columns))
            .or_else(|| {
                self.indexes
                    .values()
                    .filter(|ix| ix.unique)
                    .find_map(|ix| unique_single(&ix.columns))
            })
    }

    /// The identity columns used to key a backfill, if any: primary key
    /// first, then a unique-not-null fallback.
    pub fn identity_columns(&self) -> Vec<&Column> {
        let pk = self.primary_key_columns();
        if !pk.is_empty() {
            return pk;
        }
        self.unique_not_null_column().into_iter().collect()
    }

    /// Whether the table carries the reserved needs-backfill flag column.
    pub fn has_needs_backfill_column(&self) -> bool {
        self.has_column(reserved::NEEDS_BACKFILL_COLUMN)
    }
}

/// One column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Formatted SQL type, e.g. `character varying(255)`.
    pub data_type: String,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Default expression, verbatim from the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Whether the column is covered by a single-column unique constraint.
    #[serde(default)]
    pub unique: bool,
    /// Column comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Column {
    /// Create a nullable column of the given type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            ..Default::default()
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark the column unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set the default expression.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// A secondary index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,
    /// Indexed columns, in index order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    #[serde(default)]
    pub unique: bool,
    /// Index method (btree, hash, gin, ...).
    #[serde(default)]
    pub method: String,
}

/// A check constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckConstraint {
    /// Constraint name.
    pub name: String,
    /// Columns the constraint mentions.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Full constraint definition as reported by the catalog.
    pub definition: String,
}

/// A unique constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Constraint name.
    pub name: String,
    /// Constrained columns.
    pub columns: Vec<String>,
}

/// A foreign key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,
    /// Referencing columns.
    pub columns: Vec<String>,
    /// Referenced table.
    pub referenced_table: String,
    /// Referenced columns.
    pub referenced_columns: Vec<String>,
    /// ON DELETE action, e.g. `CASCADE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
    /// ON UPDATE action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<String>,
}
