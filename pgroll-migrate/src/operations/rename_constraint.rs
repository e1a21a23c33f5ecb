//! Rename a constraint.

use async_trait::async_trait;
use pgroll_postgres::Executor;
use pgroll_schema::Schema;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::operations::{Operation, OperationContext};
use crate::sql::{check_identifier, quote_ident, quote_qualified};

/// Rename a constraint.
///
/// A catalog-only change with no client-visible shape difference; the
/// physical rename happens at `complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameConstraint {
    /// Table the constraint lives on.
    pub table: String,
    /// Current constraint name.
    pub from: String,
    /// New constraint name.
    pub to: String,
}

#[async_trait]
impl Operation for RenameConstraint {
    fn name(&self) -> &'static str {
        "rename_constraint"
    }

    fn validate(&self, schema: &Schema) -> MigrateResult<()> {
        check_identifier(&self.to)?;
        let table = schema.require_table(&self.table)?;
        let found = table.unique_constraints.contains_key(&self.from)
            || table.check_constraints.contains_key(&self.from)
            || table.foreign_keys.contains_key(&self.from);
        if !found {
            return Err(MigrationError::validation(format!(
                "constraint '{}' not found on table '{}'",
                self.from, self.table
            )));
        }
        Ok(())
    }

    async fn start(&self, _exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        Ok(())
    }

    async fn complete(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        exec.batch_execute(&format!(
            "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
            quote_qualified(ctx.schema_name, &self.table),
            quote_ident(&self.from),
            quote_ident(&self.to)
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
        if let Some(mut uc) = table.unique_constraints.remove(&self.from) {
            uc.name = self.to.clone();
            table.unique_constraints.insert(self.to.clone(), uc);
            return Ok(());
        }
        if let Some(mut cc) = table.check_constraints.remove(&self.from) {
            cc.name = self.to.clone();
            table.check_constraints.insert(self.to.clone(), cc);
            return Ok(());
        }
        if let Some(mut fk) = table.foreign_keys.remove(&self.from) {
            fk.name = self.to.clone();
            table.foreign_keys.insert(self.to.clone(), fk);
            return Ok(());
        }
        Err(MigrationError::validation(format!(
            "constraint '{}' not found on table '{}'",
            self.from, self.table
        )))
    }
}

#[cfg(test)]
mod tests {
    use pgroll_schema::{CheckConstraint, Column, Table};

    use super::*;

    fn schema() -> Schema {
        let mut table = Table::new("people");
        table.add_column(Column::new("age", "integer")).unwrap();
        table.check_constraints.insert(
            "age_positive".to_string(),
            CheckConstraint {
                name: "age_positive".to_string(),
                columns: vec!["age".to_string()],
                definition: "CHECK (age > 0)".to_string(),
            },
        );
        let mut schema = Schema::new("public");
        schema.add_table(table).unwrap();
        schema
    }

    #[test]
    fn test_validate() {
        let op = RenameConstraint {
            table: "people".to_string(),
            from: "age_positive".to_string(),
            to: "people_age_check".to_string(),
        };
        assert!(op.validate(&schema()).is_ok());

        let reserved = RenameConstraint {
            to: "_pgroll_check".to_string(),
            ..op.clone()
        };
        assert!(reserved.validate(&schema()).is_err());
    }

    #[test]
    fn test_update_schema_moves_entry() {
        let mut schema = schema();
        let op = RenameConstraint {
            table: "people".to_string(),
            from: "age_positive".to_string(),
            to: "people_age_check".to_string(),
        };
        op.update_schema(&mut schema).unwrap();

        let table = schema.table("people").unwrap();
        assert!(!table.check_constraints.contains_key("age_positive"));
        assert_eq!(
            table.check_constraints["people_age_check"].name,
            "people_age_check"
        );
    }
}
