//! Drop a column.

use async_trait::async_trait;
use indexmap::IndexMap;
use pgroll_postgres::Executor;
use pgroll_schema::Schema;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::operations::{Operation, OperationContext};
use crate::sql::{quote_ident, quote_qualified};
use crate::trigger::{DualWriteSpec, Expression};
use crate::views::ViewPlan;

/// Drop a column.
///
/// The column stays physically present until `complete` so old-version
/// readers and writers keep working. Writers on the new version do not
/// supply it; the `down` expression computes its value for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropColumn {
    /// Table the column lives on.
    pub table: String,
    /// Column to drop.
    pub column: String,
    /// Expression filling the column for writes arriving through the new
    /// version. Required unless the column is nullable or has a default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<String>,
}

#[async_trait]
impl Operation for DropColumn {
    fn name(&self) -> &'static str {
        "drop_column"
    }

    fn validate(&self, schema: &Schema) -> MigrateResult<()> {
        let table = schema.require_table(&self.table)?;
        let column = table.require_column(&self.column)?;
        if table.primary_key.contains(&self.column) {
            return Err(MigrationError::validation(format!(
                "cannot drop primary key column '{}' of table '{}'",
                self.column, self.table
            )));
        }
        if !column.nullable && column.default.is_none() && self.down.is_none() {
            return Err(MigrationError::validation(format!(
                "dropping NOT NULL column '{}' requires a 'down' expression",
                self.column
            )));
        }
        Ok(())
    }

    async fn start(&self, _exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        Ok(())
    }

    async fn complete(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        exec.batch_execute(&format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
            quote_qualified(ctx.schema_name, &self.table),
            quote_ident(&self.column)
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
        table.drop_column(&self.column);
        Ok(())
    }

    fn project(&self, plan: &mut ViewPlan) -> MigrateResult<()> {
        plan.table_mut(&self.table)?.hide(&self.column);
        Ok(())
    }

    fn dual_writes(&self, ctx: &OperationContext<'_>) -> Vec<DualWriteSpec> {
        let Some(down) = &self.down else {
            return Vec::new();
        };
        // The expression sees the new row shape: every column except the
        // one being dropped.
        let map: IndexMap<String, String> = ctx
            .schema
            .table(&self.table)
            .map(|t| {
                t.columns
                    .iter()
                    .filter(|c| c.name != self.column)
                    .map(|c| (c.name.clone(), c.name.clone()))
                    .collect()
            })
            .unwrap_or_default();

        vec![DualWriteSpec {
            table: self.table.clone(),
            column: self.column.clone(),
            up: None,
            down: Some(Expression {
                target: self.column.clone(),
                body: down.clone(),
                map,
            }),
        }]
    }
}

#[cfg(test)]
mod tests {
    use pgroll_schema::{Column, Table};
    use pretty_assertions::assert_eq;

    use super::*;

    fn schema() -> Schema {
        let mut table = Table::new("users");
        table
            .add_column(Column::new("id", "integer").not_null())
            .unwrap();
        table
            .add_column(Column::new("email", "text").not_null())
            .unwrap();
        table.add_column(Column::new("bio", "text")).unwrap();
        table.primary_key = vec!["id".to_string()];
        let mut schema = Schema::new("public");
        schema.add_table(table).unwrap();
        schema
    }

    fn op(column: &str, down: Option<&str>) -> DropColumn {
        DropColumn {
            table: "users".to_string(),
            column: column.to_string(),
            down: down.map(String::from),
        }
    }

    #[test]
    fn test_validate() {
        // Nullable column: no down needed.
        assert!(op("bio", None).validate(&schema()).is_ok());
        // NOT NULL column without default needs a down expression.
        assert!(op("email", None).validate(&schema()).is_err());
        assert!(op("email", Some("'unknown'")).validate(&schema()).is_ok());
        // Primary key columns cannot be dropped.
        assert!(op("id", Some("0")).validate(&schema()).is_err());
    }

    #[test]
    fn test_project_hides_column() {
        let mut plan = ViewPlan::identity(&schema());
        op("bio", None).project(&mut plan).unwrap();
        assert!(!plan.table("users").unwrap().columns.contains_key("bio"));
    }

    #[test]
    fn test_dual_writes_fill_dropped_column_for_new_writers() {
        let schema = schema();
        let ctx = OperationContext {
            schema_name: "public",
            state_schema: "pgroll",
            new_version_schema: "public_02_drop_email",
            old_version_schema: Some("public_01_init"),
            schema: &schema,
        };

        let specs = op("email", Some("id::text || '@unknown'")).dual_writes(&ctx);
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert!(spec.up.is_none());
        let down = spec.down.as_ref().unwrap();
        assert_eq!(down.target, "email");
        // The dropped column is not visible to the expression.
        assert!(!down.map.contains_key("email"));
        assert!(down.map.contains_key("id"));
    }

    #[test]
    fn test_no_dual_writes_without_down() {
        let schema = schema();
        let ctx = OperationContext {
            schema_name: "public",
            state_schema: "pgroll",
            new_version_schema: "public_02_drop_bio",
            old_version_schema: None,
            schema: &schema,
        };
        assert!(op("bio", None).dual_writes(&ctx).is_empty());
    }
}
