//! Add a column.

use async_trait::async_trait;
use indexmap::IndexMap;
use pgroll_postgres::Executor;
use pgroll_schema::{Column, Schema, UniqueConstraint};
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::operations::{ColumnDef, Operation, OperationContext};
use crate::sql::{check_identifier, quote_ident, quote_literal, quote_qualified};
use crate::trigger::{DualWriteSpec, Expression};
use crate::views::ViewPlan;

/// Add a column to an existing table.
///
/// A plain nullable column with a constant default is added directly. A
/// column that needs values for pre-existing rows (declared `NOT NULL`, or
/// derived from other columns) carries an `up` expression: the column is
/// added nullable and defaultless, a dual-write trigger fills it for
/// old-version writers, the backfill fills it for existing rows, and the
/// declared constraints land at `complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddColumn {
    /// Table to add the column to.
    pub table: String,
    /// The column definition.
    pub column: ColumnDef,
    /// Expression producing the column's value from the old row shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up: Option<String>,
}

impl AddColumn {
    fn not_null_constraint(&self) -> String {
        format!("_pgroll_check_not_null_{}", self.column.name)
    }

    fn unique_index(&self) -> String {
        format!("_pgroll_unique_{}_{}", self.table, self.column.name)
    }

    fn deferred(&self) -> bool {
        self.up.is_some()
    }
}

#[async_trait]
impl Operation for AddColumn {
    fn name(&self) -> &'static str {
        "add_column"
    }

    fn validate(&self, schema: &Schema) -> MigrateResult<()> {
        check_identifier(&self.column.name)?;
        let table = schema.require_table(&self.table)?;
        if table.has_column(&self.column.name) {
            return Err(MigrationError::validation(format!(
                "column '{}' already exists on table '{}'",
                self.column.name, self.table
            )));
        }
        if self.column.pk {
            return Err(MigrationError::validation(format!(
                "cannot add '{}' as a primary key column to existing table '{}'",
                self.column.name, self.table
            )));
        }
        if !self.column.nullable && self.up.is_none() && self.column.default.is_none() {
            return Err(MigrationError::validation(format!(
                "adding NOT NULL column '{}' requires an 'up' expression or a default",
                self.column.name
            )));
        }
        Ok(())
    }

    async fn start(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        let table_q = quote_qualified(ctx.schema_name, &self.table);

        let mut parts = vec![quote_ident(&self.column.name), self.column.data_type.clone()];
        if !self.deferred() {
            if !self.column.nullable {
                parts.push("NOT NULL".to_string());
            }
            if let Some(default) = &self.column.default {
                parts.push(format!("DEFAULT {}", quote_literal(default)));
            }
            if let Some(check) = &self.column.check {
                parts.push(format!("CHECK ({})", check));
            }
        }
        exec.batch_execute(&format!(
            "ALTER TABLE {} ADD COLUMN {}",
            table_q,
            parts.join(" ")
        ))
        .await?;

        if self.deferred() && !self.column.nullable {
            exec.batch_execute(&format!(
                "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({} IS NOT NULL) NOT VALID",
                table_q,
                quote_ident(&self.not_null_constraint()),
                quote_ident(&self.column.name)
            ))
            .await?;
        }

        if self.column.unique {
            exec.batch_execute(&format!(
                "CREATE UNIQUE INDEX CONCURRENTLY IF NOT EXISTS {} ON {} ({})",
                quote_ident(&self.unique_index()),
                table_q,
                quote_ident(&self.column.name)
            ))
            .await?;
        }

        if let Some(comment) = &self.column.comment {
            exec.batch_execute(&format!(
                "COMMENT ON COLUMN {}.{} IS {}",
                table_q,
                quote_ident(&self.column.name),
                quote_literal(comment)
            ))
            .await?;
        }
        Ok(())
    }

    async fn complete(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        let table_q = quote_qualified(ctx.schema_name, &self.table);

        if self.deferred() {
            if !self.column.nullable {
                let constraint = quote_ident(&self.not_null_constraint());
                exec.batch_execute(&format!(
                    "ALTER TABLE {} VALIDATE CONSTRAINT {}",
                    table_q, constraint
                ))
                .await?;
                exec.batch_execute(&format!(
                    "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
                    table_q,
                    quote_ident(&self.column.name)
                ))
                .await?;
                exec.batch_execute(&format!(
                    "ALTER TABLE {} DROP CONSTRAINT {}",
                    table_q, constraint
                ))
                .await?;
            }
            if let Some(default) = &self.column.default {
                exec.batch_execute(&format!(
                    "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                    table_q,
                    quote_ident(&self.column.name),
                    quote_literal(default)
                ))
                .await?;
            }
        }

        if self.column.unique {
            exec.batch_execute(&format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE USING INDEX {}",
                table_q,
                quote_ident(&format!("{}_{}_key", self.table, self.column.name)),
                quote_ident(&self.unique_index())
            ))
            .await?;
        }
        Ok(())
    }

    async fn rollback(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        exec.batch_execute(&format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
            quote_qualified(ctx.schema_name, &self.table),
            quote_ident(&self.column.name)
        ))
        .await?;
        Ok(())
    }

    fn update_schema(&self, schema: &mut Schema) -> MigrateResult<()> {
        let table_name = self.table.clone();
        let table = schema
            .table_mut(&self.table)
            .ok_or_else(|| MigrationError::validation(format!("table '{}' not found", table_name)))?;
        let mut column = Column::new(&self.column.name, &self.column.data_type);
        column.nullable = self.column.nullable;
        column.unique = self.column.unique;
        column.default = self.column.default.clone();
        column.comment = self.column.comment.clone();
        table.add_column(column)?;
        if self.column.unique {
            let name = format!("{}_{}_key", self.table, self.column.name);
            table.unique_constraints.insert(
                name.clone(),
                UniqueConstraint {
                    name,
                    columns: vec![self.column.name.clone()],
                },
            );
        }
        Ok(())
    }

    fn project(&self, plan: &mut ViewPlan) -> MigrateResult<()> {
        plan.table_mut(&self.table)?
            .expose(&self.column.name, &self.column.name);
        Ok(())
    }

    fn dual_writes(&self, ctx: &OperationContext<'_>) -> Vec<DualWriteSpec> {
        let Some(up) = &self.up else {
            return Vec::new();
        };
        // The expression sees the old row shape; the new column is its
        // target, not an input.
        let map: IndexMap<String, String> = ctx
            .schema
            .table(&self.table)
            .map(|t| {
                t.columns
                    .iter()
                    .map(|c| (c.name.clone(), c.name.clone()))
                    .collect()
            })
            .unwrap_or_default();

        vec![DualWriteSpec {
            table: self.table.clone(),
            column: self.column.name.clone(),
            up: Some(Expression {
                target: self.column.name.clone(),
                body: up.clone(),
                map,
            }),
            down: None,
        }]
    }

    fn backfill_table(&self) -> Option<&str> {
        self.up.as_ref().map(|_| self.table.as_str())
    }

    fn transactional(&self) -> bool {
        !self.column.unique
    }
}
