//! Create a table.

use async_trait::async_trait;
use indexmap::IndexMap;
use pgroll_postgres::Executor;
use pgroll_schema::{Column, Schema, Table, UniqueConstraint};
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::operations::{ColumnDef, Operation, OperationContext};
use crate::sql::{check_identifier, quote_ident, quote_literal, quote_qualified};
use crate::views::{TableProjection, ViewPlan};

/// Create a new table.
///
/// The table becomes visible in the new version only; the old version's
/// views never list it, so `rollback` can drop it without data concerns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTable {
    /// Table name.
    pub name: String,
    /// Column definitions.
    pub columns: Vec<ColumnDef>,
    /// Table comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl CreateTable {
    fn render_ddl(&self, schema: &str) -> String {
        let mut clauses: Vec<String> = self.columns.iter().map(ColumnDef::render).collect();

        let pk: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.pk)
            .map(|c| quote_ident(&c.name))
            .collect();
        if !pk.is_empty() {
            clauses.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        }

        format!(
            "CREATE TABLE {} ({})",
            quote_qualified(schema, &self.name),
            clauses.join(", ")
        )
    }
}

#[async_trait]
impl Operation for CreateTable {
    fn name(&self) -> &'static str {
        "create_table"
    }

    fn validate(&self, schema: &Schema) -> MigrateResult<()> {
        check_identifier(&self.name)?;
        if schema.table(&self.name).is_some() {
            return Err(MigrationError::validation(format!(
                "table '{}' already exists",
                self.name
            )));
        }
        if self.columns.is_empty() {
            return Err(MigrationError::validation(format!(
                "table '{}' must have at least one column",
                self.name
            )));
        }
        for column in &self.columns {
            check_identifier(&column.name)?;
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(MigrationError::validation(format!(
                    "duplicate column '{}' in table '{}'",
                    column.name, self.name
                )));
            }
        }
        Ok(())
    }

    async fn start(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        exec.batch_execute(&self.render_ddl(ctx.schema_name)).await?;

        if let Some(comment) = &self.comment {
            exec.batch_execute(&format!(
                "COMMENT ON TABLE {} IS {}",
                quote_qualified(ctx.schema_name, &self.name),
                quote_literal(comment)
            ))
            .await?;
        }
        for column in &self.columns {
            if let Some(comment) = &column.comment {
                exec.batch_execute(&format!(
                    "COMMENT ON COLUMN {}.{} IS {}",
                    quote_qualified(ctx.schema_name, &self.name),
                    quote_ident(&column.name),
                    quote_literal(comment)
                ))
                .await?;
            }
        }
        Ok(())
    }

    async fn complete(&self, _exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        Ok(())
    }

    async fn rollback(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        exec.batch_execute(&format!(
            "DROP TABLE IF EXISTS {}",
            quote_qualified(ctx.schema_name, &self.name)
        ))
        .await?;
        Ok(())
    }

    fn update_schema(&self, schema: &mut Schema) -> MigrateResult<()> {
        let mut table = Table::new(&self.name);
        table.comment = self.comment.clone();
        for def in &self.columns {
            let mut column = Column::new(&def.name, &def.data_type);
            column.nullable = def.nullable && !def.pk;
            column.unique = def.unique;
            column.default = def.default.clone();
            column.comment = def.comment.clone();
            table.add_column(column)?;
            if def.pk {
                table.primary_key.push(def.name.clone());
            }
            if def.unique {
                let name = format!("{}_{}_key", self.name, def.name);
                table.unique_constraints.insert(
                    name.clone(),
                    UniqueConstraint {
                        name,
                        columns: vec![def.name.clone()],
                    },
                );
            }
        }
        schema.add_table(table)?;
        Ok(())
    }

    fn project(&self, plan: &mut ViewPlan) -> MigrateResult<()> {
        let columns: IndexMap<String, String> = self
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.name.clone()))
            .collect();
        plan.add_table(
            &self.name,
            TableProjection {
                table: self.name.clone(),
                columns,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn op() -> CreateTable {
        let mut id = ColumnDef::new("id", "integer");
        id.pk = true;
        id.nullable = false;
        let mut name = ColumnDef::new("name", "varchar(255)");
        name.unique = true;
        CreateTable {
            name: "users".to_string(),
            columns: vec![id, name],
            comment: None,
        }
    }

    #[test]
    fn test_render_ddl() {
        assert_eq!(
            op().render_ddl("public"),
            "CREATE TABLE \"public\".\"users\" (\
             \"id\" integer NOT NULL, \
             \"name\" varchar(255) UNIQUE, \
             PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn test_validate_rejects_existing_table() {
        let mut schema = Schema::new("public");
        schema.add_table(Table::new("users")).unwrap();
        assert!(op().validate(&schema).is_err());
    }

    #[test]
    fn test_validate_rejects_reserved_names() {
        let schema = Schema::new("public");
        let mut bad = op();
        bad.name = "pgroll_users".to_string();
        assert!(bad.validate(&schema).is_err());

        let mut bad = op();
        bad.columns[0].name = "_pgroll_id".to_string();
        assert!(bad.validate(&schema).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_columns() {
        let schema = Schema::new("public");
        let mut bad = op();
        bad.columns[1].name = "id".to_string();
        assert!(bad.validate(&schema).is_err());
    }

    #[test]
    fn test_update_schema_builds_table() {
        let mut schema = Schema::new("public");
        op().update_schema(&mut schema).unwrap();

        let table = schema.table("users").unwrap();
        assert_eq!(table.primary_key, vec!["id".to_string()]);
        assert!(!table.column("id").unwrap().nullable);
        assert!(table.column("name").unwrap().unique);
        assert!(table.unique_constraints.contains_key("users_name_key"));
    }

    #[test]
    fn test_project_adds_identity_projection() {
        let mut plan = ViewPlan::default();
        op().project(&mut plan).unwrap();
        let projection = plan.table("users").unwrap();
        assert_eq!(projection.table, "users");
        assert_eq!(
            projection.columns.keys().collect::<Vec<_>>(),
            vec!["id", "name"]
        );
    }
}
