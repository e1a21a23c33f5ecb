//! Drop a table.

use async_trait::async_trait;
use pgroll_postgres::Executor;
use pgroll_schema::Schema;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::operations::{Operation, OperationContext};
use crate::sql::quote_qualified;
use crate::views::ViewPlan;

/// Drop a table.
///
/// The table stays physically present (and writable through the old
/// version) until `complete`; the new version simply stops exposing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropTable {
    /// Table name.
    pub name: String,
}

#[async_trait]
impl Operation for DropTable {
    fn name(&self) -> &'static str {
        "drop_table"
    }

    fn validate(&self, schema: &Schema) -> MigrateResult<()> {
        schema.require_table(&self.name)?;
        Ok(())
    }

    async fn start(&self, _exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        Ok(())
    }

    async fn complete(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        exec.batch_execute(&format!(
            "DROP TABLE IF EXISTS {}",
            quote_qualified(ctx.schema_name, &self.name)
        ))
        .await?;
        Ok(())
    }

    async fn rollback(&self, _exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        Ok(())
    }

    fn update_schema(&self, schema: &mut Schema) -> MigrateResult<()> {
        if schema.remove_table(&self.name).is_none() {
            return Err(MigrationError::validation(format!(
                "table '{}' not found",
                self.name
            )));
        }
        Ok(())
    }

    fn project(&self, plan: &mut ViewPlan) -> MigrateResult<()> {
        plan.remove_table(&self.name);
        Ok(())
    }
}
