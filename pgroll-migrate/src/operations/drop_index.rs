//! Drop an index.

use async_trait::async_trait;
use pgroll_postgres::Executor;
use pgroll_schema::Schema;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::operations::{Operation, OperationContext};
use crate::sql::quote_qualified;

/// Drop an index.
///
/// Both versions tolerate the index's absence, so nothing happens at
/// `start`; the drop is deferred to `complete`, the point of no return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropIndex {
    /// Index name.
    pub name: String,
}

#[async_trait]
impl Operation for DropIndex {
    fn name(&self) -> &'static str {
        "drop_index"
    }

    fn validate(&self, schema: &Schema) -> MigrateResult<()> {
        let found = schema
            .tables
            .values()
            .any(|t| t.indexes.contains_key(&self.name));
        if !found {
            return Err(MigrationError::validation(format!(
                "index '{}' not found",
                self.name
            )));
        }
        Ok(())
    }

    async fn start(&self, _exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        Ok(())
    }

    async fn complete(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        exec.batch_execute(&format!(
            "DROP INDEX IF EXISTS {}",
            quote_qualified(ctx.schema_name, &self.name)
        ))
        .await?;
        Ok(())
    }

    async fn rollback(&self, _exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        Ok(())
    }

    fn update_schema(&self, schema: &mut Schema) -> MigrateResult<()> {
        for table in schema.tables.values_mut() {
            if table.indexes.remove(&self.name).is_some() {
                return Ok(());
            }
        }
        Err(MigrationError::validation(format!(
            "index '{}' not found",
            self.name
        )))
    }
}
