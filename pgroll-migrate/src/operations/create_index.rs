//! Create an index concurrently.

use async_trait::async_trait;
use pgroll_postgres::Executor;
use pgroll_schema::{Index, Schema};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MigrateResult, MigrationError};
use crate::operations::{Operation, OperationContext};
use crate::sql::{check_identifier, quote_ident, quote_qualified};

/// Create an index with `CREATE INDEX CONCURRENTLY`.
///
/// Concurrent builds cannot run inside a transaction block, so this
/// operation runs on an autocommit connection. A build that fails midway
/// leaves an invalid index behind; both the failure path and `rollback`
/// drop it so a retried `start` is clean.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIndex {
    /// Table to index.
    pub table: String,
    /// Index name.
    pub name: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    #[serde(default)]
    pub unique: bool,
    /// Index method; btree when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl CreateIndex {
    fn render_create(&self, schema: &str) -> String {
        let unique = if self.unique { "UNIQUE " } else { "" };
        let using = match &self.method {
            Some(method) => format!(" USING {}", method),
            None => String::new(),
        };
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "CREATE {}INDEX CONCURRENTLY IF NOT EXISTS {} ON {}{} ({})",
            unique,
            quote_ident(&self.name),
            quote_qualified(schema, &self.table),
            using,
            columns.join(", ")
        )
    }

    async fn drop_concurrently(&self, exec: &Executor<'_>, schema: &str) -> MigrateResult<()> {
        exec.batch_execute(&format!(
            "DROP INDEX CONCURRENTLY IF EXISTS {}",
            quote_qualified(schema, &self.name)
        ))
        .await?;
        Ok(())
    }

    async fn is_valid(&self, exec: &Executor<'_>, schema: &str) -> MigrateResult<bool> {
        let row = exec
            .query_opt(
                "SELECT ix.indisvalid AS valid \
                 FROM pg_index ix \
                 JOIN pg_class i ON i.oid = ix.indexrelid \
                 JOIN pg_namespace n ON n.oid = i.relnamespace \
                 WHERE n.nspname = $1 AND i.relname = $2",
                &[&schema, &self.name.as_str()],
            )
            .await?;
        Ok(row.map(|r| r.get("valid")).unwrap_or(false))
    }
}

#[async_trait]
impl Operation for CreateIndex {
    fn name(&self) -> &'static str {
        "create_index"
    }

    fn validate(&self, schema: &Schema) -> MigrateResult<()> {
        check_identifier(&self.name)?;
        let table = schema.require_table(&self.table)?;
        if self.columns.is_empty() {
            return Err(MigrationError::validation(format!(
                "index '{}' must cover at least one column",
                self.name
            )));
        }
        for column in &self.columns {
            table.require_column(column)?;
        }
        if table.indexes.contains_key(&self.name) {
            return Err(MigrationError::validation(format!(
                "index '{}' already exists on table '{}'",
                self.name, self.table
            )));
        }
        Ok(())
    }

    async fn start(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        if let Err(e) = exec.batch_execute(&self.render_create(ctx.schema_name)).await {
            // A failed concurrent build leaves an invalid index behind;
            // drop it so the operation is idempotent under retry.
            warn!(index = %self.name, error = %e, "Concurrent index build failed");
            self.drop_concurrently(exec, ctx.schema_name).await?;
            return Err(e.into());
        }

        if !self.is_valid(exec, ctx.schema_name).await? {
            self.drop_concurrently(exec, ctx.schema_name).await?;
            return Err(MigrationError::invariant(format!(
                "index '{}' was not valid after concurrent build",
                self.name
            )));
        }
        Ok(())
    }

    async fn complete(&self, _exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        Ok(())
    }

    async fn rollback(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        self.drop_concurrently(exec, ctx.schema_name).await
    }

    fn update_schema(&self, schema: &mut Schema) -> MigrateResult<()> {
        let table = schema
            .table_mut(&self.table)
            .ok_or_else(|| MigrationError::validation(format!("table '{}' not found", self.table)))?;
        table.indexes.insert(
            self.name.clone(),
            Index {
                name: self.name.clone(),
                columns: self.columns.clone(),
                unique: self.unique,
                method: self.method.clone().unwrap_or_else(|| "btree".to_string()),
            },
        );
        Ok(())
    }

    fn transactional(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use pgroll_schema::{Column, Table};
    use pretty_assertions::assert_eq;

    use super::*;

    fn schema() -> Schema {
        let mut table = Table::new("users");
        table.add_column(Column::new("email", "text")).unwrap();
        let mut schema = Schema::new("public");
        schema.add_table(table).unwrap();
        schema
    }

    fn op() -> CreateIndex {
        CreateIndex {
            table: "users".to_string(),
            name: "users_email_idx".to_string(),
            columns: vec!["email".to_string()],
            unique: false,
            method: None,
        }
    }

    #[test]
    fn test_render_create() {
        assert_eq!(
            op().render_create("public"),
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS \"users_email_idx\" \
             ON \"public\".\"users\" (\"email\")"
        );

        let mut unique = op();
        unique.unique = true;
        unique.method = Some("btree".to_string());
        assert_eq!(
            unique.render_create("public"),
            "CREATE UNIQUE INDEX CONCURRENTLY IF NOT EXISTS \"users_email_idx\" \
             ON \"public\".\"users\" USING btree (\"email\")"
        );
    }

    #[test]
    fn test_validate() {
        assert!(op().validate(&schema()).is_ok());

        let mut missing = op();
        missing.columns = vec!["missing".to_string()];
        assert!(missing.validate(&schema()).is_err());

        let mut empty = op();
        empty.columns.clear();
        assert!(empty.validate(&schema()).is_err());
    }

    #[test]
    fn test_runs_outside_transactions() {
        assert!(!op().transactional());
    }

    #[test]
    fn test_update_schema_records_index() {
        let mut schema = schema();
        op().update_schema(&mut schema).unwrap();
        let index = &schema.table("users").unwrap().indexes["users_email_idx"];
        assert_eq!(index.method, "btree");
    }
}
