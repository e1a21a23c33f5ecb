//! The operation set.
//!
//! Each migration operation implements the same phase contract:
//! `validate` against the (virtually evolved) schema, `start` to expand,
//! `complete` to contract, `rollback` to undo an unfinished expansion.
//! Between `start` and `complete` an operation also describes its view
//! projection, its dual-write requirements, and whether its table must be
//! backfilled.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use pgroll_postgres::Executor;
use pgroll_schema::Schema;
use serde::{Deserialize, Serialize};

use crate::error::MigrateResult;
use crate::sql::{quote_ident, quote_literal};
use crate::trigger::DualWriteSpec;
use crate::views::ViewPlan;

mod add_column;
mod alter_column;
mod create_constraint;
mod create_index;
mod create_table;
mod drop_column;
mod drop_constraint;
mod drop_index;
mod drop_table;
mod raw_sql;
mod rename_constraint;
mod rename_table;

pub use add_column::AddColumn;
pub use alter_column::{AlterColumn, CheckDef};
pub use create_constraint::{ConstraintKind, CreateConstraint, ForeignKeyReference};
pub use create_index::CreateIndex;
pub use create_table::CreateTable;
pub use drop_column::DropColumn;
pub use drop_constraint::DropConstraint;
pub use drop_index::DropIndex;
pub use drop_table::DropTable;
pub use raw_sql::RawSql;
pub use rename_constraint::RenameConstraint;
pub use rename_table::RenameTable;

/// Everything an operation needs to know about its surroundings.
pub struct OperationContext<'a> {
    /// Logical schema under migration.
    pub schema_name: &'a str,
    /// The reserved state schema.
    pub state_schema: &'a str,
    /// Version schema of the in-flight migration.
    pub new_version_schema: &'a str,
    /// Version schema of the latest completed migration, if any.
    pub old_version_schema: Option<&'a str>,
    /// The schema as reflected before any `start` DDL ran.
    pub schema: &'a Schema,
}

/// The per-operation phase contract.
///
/// `transactional` governs the execution context of `start` and
/// `rollback`: transactional operations run inside one phase transaction
/// each; non-transactional ones (concurrent index builds) get an
/// autocommit connection. `complete` always runs inside the engine's
/// single completion transaction.
#[async_trait]
pub trait Operation: Send + Sync + fmt::Debug {
    /// Short operation name for logs and error context.
    fn name(&self) -> &'static str;

    /// Check the operation against the (virtually evolved) schema.
    fn validate(&self, schema: &Schema) -> MigrateResult<()>;

    /// Expand: make the new shape exist alongside the old.
    async fn start(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()>;

    /// Contract: make the new shape the only shape.
    async fn complete(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()>;

    /// Undo an expansion that will not be completed.
    async fn rollback(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()>;

    /// Evolve the virtual schema to the operation's end state. Later
    /// operations in the same migration validate against the result.
    fn update_schema(&self, schema: &mut Schema) -> MigrateResult<()>;

    /// Adjust the new version's view projections.
    fn project(&self, plan: &mut ViewPlan) -> MigrateResult<()> {
        let _ = plan;
        Ok(())
    }

    /// The dual writes this operation needs while in progress.
    fn dual_writes(&self, ctx: &OperationContext<'_>) -> Vec<DualWriteSpec> {
        let _ = ctx;
        Vec::new()
    }

    /// The table whose pre-existing rows must be backfilled, if any.
    fn backfill_table(&self) -> Option<&str> {
        None
    }

    /// Whether the operation requires a backfill.
    fn requires_backfill(&self) -> bool {
        self.backfill_table().is_some()
    }

    /// Logical column renames, keyed by table.
    fn column_renames(&self) -> HashMap<String, HashMap<String, String>> {
        HashMap::new()
    }

    /// Whether `start` and `rollback` run inside a transaction.
    fn transactional(&self) -> bool {
        true
    }
}

/// A migration operation, dispatched on the `kind` field of its JSON
/// document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
    /// Create a table.
    CreateTable(CreateTable),
    /// Drop a table.
    DropTable(DropTable),
    /// Rename a table.
    RenameTable(RenameTable),
    /// Add a column.
    AddColumn(AddColumn),
    /// Drop a column.
    DropColumn(DropColumn),
    /// Alter a column (rename, retype, nullability, default, unique, check).
    AlterColumn(AlterColumn),
    /// Create an index concurrently.
    CreateIndex(CreateIndex),
    /// Drop an index.
    DropIndex(DropIndex),
    /// Create a constraint (unique, check, foreign key).
    CreateConstraint(CreateConstraint),
    /// Drop a constraint.
    DropConstraint(DropConstraint),
    /// Rename a constraint.
    RenameConstraint(RenameConstraint),
    /// Run raw SQL.
    RawSql(RawSql),
}

impl Op {
    /// The operation behind this document.
    pub fn as_operation(&self) -> &dyn Operation {
        match self {
            Self::CreateTable(op) => op,
            Self::DropTable(op) => op,
            Self::RenameTable(op) => op,
            Self::AddColumn(op) => op,
            Self::DropColumn(op) => op,
            Self::AlterColumn(op) => op,
            Self::CreateIndex(op) => op,
            Self::DropIndex(op) => op,
            Self::CreateConstraint(op) => op,
            Self::DropConstraint(op) => op,
            Self::RenameConstraint(op) => op,
            Self::RawSql(op) => op,
        }
    }
}

/// A column definition as written in a migration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// SQL type, verbatim.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Whether the column is part of the primary key.
    #[serde(default)]
    pub pk: bool,
    /// Whether NULL is allowed.
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Whether the column gets a single-column unique constraint.
    #[serde(default)]
    pub unique: bool,
    /// Default value (quoted as a literal when rendered).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Check expression over this column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    /// Column comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ColumnDef {
    /// Create a nullable column definition.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            pk: false,
            nullable: true,
            unique: false,
            default: None,
            check: None,
            comment: None,
        }
    }

    /// Render the column clause for CREATE TABLE / ADD COLUMN.
    pub(crate) fn render(&self) -> String {
        let mut parts = vec![quote_ident(&self.name), self.data_type.clone()];
        if !self.nullable {
            parts.push("NOT NULL".to_string());
        }
        if self.unique {
            parts.push("UNIQUE".to_string());
        }
        if let Some(default) = &self.default {
            parts.push(format!("DEFAULT {}", quote_literal(default)));
        }
        if let Some(check) = &self.check {
            parts.push(format!("CHECK ({})", check));
        }
        parts.join(" ")
    }
}
