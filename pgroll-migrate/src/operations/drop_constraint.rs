//! Drop a constraint.

use async_trait::async_trait;
use pgroll_postgres::Executor;
use pgroll_schema::Schema;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::operations::{Operation, OperationContext};
use crate::sql::{quote_ident, quote_qualified};

/// Drop a unique, check, or foreign key constraint.
///
/// The constraint stays enforced for both versions until `complete`;
/// rows written during the migration therefore satisfy it, which keeps
/// `rollback` trivial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropConstraint {
    /// Table the constraint lives on.
    pub table: String,
    /// Constraint name.
    pub name: String,
}

#[async_trait]
impl Operation for DropConstraint {
    fn name(&self) -> &'static str {
        "drop_constraint"
    }

    fn validate(&self, schema: &Schema) -> MigrateResult<()> {
        let table = schema.require_table(&self.table)?;
        let found = table.unique_constraints.contains_key(&self.name)
            || table.check_constraints.contains_key(&self.name)
            || table.foreign_keys.contains_key(&self.name);
        if !found {
            return Err(MigrationError::validation(format!(
                "constraint '{}' not found on table '{}'",
                self.name, self.table
            )));
        }
        Ok(())
    }

    async fn start(&self, _exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        Ok(())
    }

    async fn complete(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        exec.batch_execute(&format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
            quote_qualified(ctx.schema_name, &self.table),
            quote_ident(&self.name)
        ))
        .await?;
        Ok(())
    }

    async fn rollback(&self, _exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        Ok(())
    }

    fn update_schema(&self, schema: &mut Schema) -> MigrateResult<()> {
        let table = schema
            .table_mut(&self.table)
            .ok_or_else(|| MigrationError::validation(format!("table '{}' not found", self.table)))?;
        if let Some(uc) = table.unique_constraints.remove(&self.name) {
            if uc.columns.len() == 1
                && let Some(column) = table.column_mut(&uc.columns[0])
            {
                column.unique = false;
            }
            return Ok(());
        }
        if table.check_constraints.remove(&self.name).is_some() {
            return Ok(());
        }
        if table.foreign_keys.remove(&self.name).is_some() {
            return Ok(());
        }
        Err(MigrationError::validation(format!(
            "constraint '{}' not found on table '{}'",
            self.name, self.table
        )))
    }
}

#[cfg(test)]
mod tests {
    use pgroll_schema::{Column, Table, UniqueConstraint};

    use super::*;

    fn schema() -> Schema {
        let mut table = Table::new("users");
        table
            .add_column(Column::new("email", "text").unique())
            .unwrap();
        table.unique_constraints.insert(
            "users_email_key".to_string(),
            UniqueConstraint {
                name: "users_email_key".to_string(),
                columns: vec!["email".to_string()],
            },
        );
        let mut schema = Schema::new("public");
        schema.add_table(table).unwrap();
        schema
    }

    #[test]
    fn test_validate_requires_existing_constraint() {
        let op = DropConstraint {
            table: "users".to_string(),
            name: "users_email_key".to_string(),
        };
        assert!(op.validate(&schema()).is_ok());

        let missing = DropConstraint {
            table: "users".to_string(),
            name: "nope".to_string(),
        };
        assert!(missing.validate(&schema()).is_err());
    }

    #[test]
    fn test_update_schema_clears_unique_flag() {
        let mut schema = schema();
        let op = DropConstraint {
            table: "users".to_string(),
            name: "users_email_key".to_string(),
        };
        op.update_schema(&mut schema).unwrap();

        let table = schema.table("users").unwrap();
        assert!(table.unique_constraints.is_empty());
        assert!(!table.column("email").unwrap().unique);
    }
}
