//! Rename a table.

use async_trait::async_trait;
use pgroll_postgres::Executor;
use pgroll_schema::Schema;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::operations::{Operation, OperationContext};
use crate::sql::{check_identifier, quote_ident, quote_qualified};
use crate::views::ViewPlan;

/// Rename a table.
///
/// During the migration the rename is purely logical: the new version's
/// view carries the new name over the old physical table. The physical
/// rename happens at `complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameTable {
    /// Current table name.
    pub from: String,
    /// New table name.
    pub to: String,
}

#[async_trait]
impl Operation for RenameTable {
    fn name(&self) -> &'static str {
        "rename_table"
    }

    fn validate(&self, schema: &Schema) -> MigrateResult<()> {
        check_identifier(&self.to)?;
        schema.require_table(&self.from)?;
        if schema.table(&self.to).is_some() {
            return Err(MigrationError::validation(format!(
                "table '{}' already exists",
                self.to
            )));
        }
        Ok(())
    }

    async fn start(&self, _exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        Ok(())
    }

    async fn complete(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        exec.batch_execute(&format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_qualified(ctx.schema_name, &self.from),
            quote_ident(&self.to)
        ))
        .await?;
        Ok(())
    }

    async fn rollback(&self, _exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        Ok(())
    }

    fn update_schema(&self, schema: &mut Schema) -> MigrateResult<()> {
        schema.rename_table(&self.from, &self.to)?;
        Ok(())
    }

    fn project(&self, plan: &mut ViewPlan) -> MigrateResult<()> {
        plan.rename_table(&self.from, &self.to)
    }
}

#[cfg(test)]
mod tests {
    use pgroll_schema::Table;

    use super::*;

    fn op() -> RenameTable {
        RenameTable {
            from: "users".to_string(),
            to: "accounts".to_string(),
        }
    }

    fn schema() -> Schema {
        let mut schema = Schema::new("public");
        schema.add_table(Table::new("users")).unwrap();
        schema
    }

    #[test]
    fn test_validate() {
        assert!(op().validate(&schema()).is_ok());

        let mut conflicting = schema();
        conflicting.add_table(Table::new("accounts")).unwrap();
        assert!(op().validate(&conflicting).is_err());

        let mut reserved = op();
        reserved.to = "batch_jobs".to_string();
        assert!(reserved.validate(&schema()).is_err());
    }

    #[test]
    fn test_project_renames_view_only() {
        let mut plan = ViewPlan::identity(&schema());
        op().project(&mut plan).unwrap();

        // The view is renamed but still reads the old physical table.
        assert!(plan.table("users").is_none());
        assert_eq!(plan.table("accounts").unwrap().table, "users");
    }

    #[test]
    fn test_update_schema() {
        let mut schema = schema();
        op().update_schema(&mut schema).unwrap();
        assert!(schema.table("accounts").is_some());
    }
}
