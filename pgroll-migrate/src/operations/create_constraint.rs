//! Create a constraint.

use std::collections::HashMap;

use async_trait::async_trait;
use indexmap::IndexMap;
use pgroll_postgres::Executor;
use pgroll_schema::{
    CheckConstraint, ForeignKey, Schema, UniqueConstraint, reserved,
};
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::operations::{Operation, OperationContext};
use crate::sql::{check_identifier, quote_ident, quote_qualified};
use crate::trigger::{DualWriteSpec, Expression, substitute_columns};
use crate::views::ViewPlan;

/// What kind of constraint to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Multi-column unique constraint.
    Unique,
    /// Check constraint.
    Check,
    /// Foreign key.
    ForeignKey,
}

/// The referenced side of a foreign key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyReference {
    /// Referenced table.
    pub table: String,
    /// Referenced columns.
    pub columns: Vec<String>,
    /// ON DELETE action, e.g. `CASCADE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
    /// ON UPDATE action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<String>,
}

/// Create a unique, check, or foreign key constraint over existing
/// columns.
///
/// Existing rows may violate the new constraint, so each referenced
/// column is duplicated into a shadow column that carries the constraint
/// as `NOT VALID`. The per-column `up` expressions scrub values on the
/// way into the shadows (for old-version writers and the backfill);
/// `down` maps shadow values back for new-version writers. `complete`
/// validates and promotes the shadows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConstraint {
    /// Table the constraint lives on.
    pub table: String,
    /// Constraint name.
    pub name: String,
    /// Constraint kind.
    #[serde(rename = "type")]
    pub kind: ConstraintKind,
    /// Constrained columns.
    pub columns: Vec<String>,
    /// Check expression (check constraints).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    /// Referenced side (foreign keys).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ForeignKeyReference>,
    /// Per-column rewrite into the constrained shape; identity when
    /// omitted.
    #[serde(default)]
    pub up: HashMap<String, String>,
    /// Per-column rewrite back to the old shape; identity when omitted.
    #[serde(default)]
    pub down: HashMap<String, String>,
}

impl CreateConstraint {
    fn unique_index(&self) -> String {
        format!("_pgroll_unique_{}", self.name)
    }

    fn not_null_helper(&self, column: &str) -> String {
        format!("_pgroll_notnull_{}_{}", self.name, column)
    }

    fn shadow_map(&self) -> IndexMap<String, String> {
        self.columns
            .iter()
            .map(|c| (c.clone(), reserved::shadow_column(c)))
            .collect()
    }
}

#[async_trait]
impl Operation for CreateConstraint {
    fn name(&self) -> &'static str {
        "create_constraint"
    }

    fn validate(&self, schema: &Schema) -> MigrateResult<()> {
        check_identifier(&self.name)?;
        let table = schema.require_table(&self.table)?;
        if self.columns.is_empty() {
            return Err(MigrationError::validation(format!(
                "constraint '{}' must cover at least one column",
                self.name
            )));
        }
        for column in &self.columns {
            table.require_column(column)?;
        }
        let taken = table.unique_constraints.contains_key(&self.name)
            || table.check_constraints.contains_key(&self.name)
            || table.foreign_keys.contains_key(&self.name);
        if taken {
            return Err(MigrationError::validation(format!(
                "constraint '{}' already exists on table '{}'",
                self.name, self.table
            )));
        }

        match self.kind {
            ConstraintKind::Check => {
                if self.check.is_none() {
                    return Err(MigrationError::validation(format!(
                        "check constraint '{}' requires a 'check' expression",
                        self.name
                    )));
                }
            }
            ConstraintKind::ForeignKey => {
                let references = self.references.as_ref().ok_or_else(|| {
                    MigrationError::validation(format!(
                        "foreign key '{}' requires a 'references' section",
                        self.name
                    ))
                })?;
                let referenced = schema.require_table(&references.table)?;
                for column in &references.columns {
                    referenced.require_column(column)?;
                }
                if references.columns.len() != self.columns.len() {
                    return Err(MigrationError::validation(format!(
                        "foreign key '{}' references {} columns but constrains {}",
                        self.name,
                        references.columns.len(),
                        self.columns.len()
                    )));
                }
            }
            ConstraintKind::Unique => {}
        }
        Ok(())
    }

    async fn start(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        let table_q = quote_qualified(ctx.schema_name, &self.table);
        let table = ctx.schema.require_table(&self.table)?;

        for column in &self.columns {
            let original = table.require_column(column)?;
            let shadow = reserved::shadow_column(column);
            exec.batch_execute(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table_q,
                quote_ident(&shadow),
                original.data_type
            ))
            .await?;

            if !original.nullable {
                exec.batch_execute(&format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({} IS NOT NULL) NOT VALID",
                    table_q,
                    quote_ident(&self.not_null_helper(column)),
                    quote_ident(&shadow)
                ))
                .await?;
            }
        }

        let shadows: Vec<String> = self
            .columns
            .iter()
            .map(|c| quote_ident(&reserved::shadow_column(c)))
            .collect();

        match self.kind {
            ConstraintKind::Check => {
                let check = self.check.as_ref().ok_or_else(|| {
                    MigrationError::validation(format!(
                        "check constraint '{}' requires a 'check' expression",
                        self.name
                    ))
                })?;
                exec.batch_execute(&format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({}) NOT VALID",
                    table_q,
                    quote_ident(&self.name),
                    substitute_columns(check, &self.shadow_map())
                ))
                .await?;
            }
            ConstraintKind::ForeignKey => {
                let references = self.references.as_ref().ok_or_else(|| {
                    MigrationError::validation(format!(
                        "foreign key '{}' requires a 'references' section",
                        self.name
                    ))
                })?;
                let referenced: Vec<String> =
                    references.columns.iter().map(|c| quote_ident(c)).collect();
                let mut ddl = format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                    table_q,
                    quote_ident(&self.name),
                    shadows.join(", "),
                    quote_qualified(ctx.schema_name, &references.table),
                    referenced.join(", ")
                );
                if let Some(action) = &references.on_delete {
                    ddl.push_str(&format!(" ON DELETE {}", action));
                }
                if let Some(action) = &references.on_update {
                    ddl.push_str(&format!(" ON UPDATE {}", action));
                }
                ddl.push_str(" NOT VALID");
                exec.batch_execute(&ddl).await?;
            }
            ConstraintKind::Unique => {
                exec.batch_execute(&format!(
                    "CREATE UNIQUE INDEX CONCURRENTLY IF NOT EXISTS {} ON {} ({})",
                    quote_ident(&self.unique_index()),
                    table_q,
                    shadows.join(", ")
                ))
                .await?;
            }
        }
        Ok(())
    }

    async fn complete(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        let table_q = quote_qualified(ctx.schema_name, &self.table);
        let table = ctx.schema.require_table(&self.table)?;

        if matches!(self.kind, ConstraintKind::Check | ConstraintKind::ForeignKey) {
            exec.batch_execute(&format!(
                "ALTER TABLE {} VALIDATE CONSTRAINT {}",
                table_q,
                quote_ident(&self.name)
            ))
            .await?;
        }
        for column in &self.columns {
            if !table.require_column(column)?.nullable {
                exec.batch_execute(&format!(
                    "ALTER TABLE {} VALIDATE CONSTRAINT {}",
                    table_q,
                    quote_ident(&self.not_null_helper(column))
                ))
                .await?;
            }
        }

        for column in &self.columns {
            exec.batch_execute(&format!(
                "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
                table_q,
                quote_ident(column)
            ))
            .await?;
            exec.batch_execute(&format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                table_q,
                quote_ident(&reserved::shadow_column(column)),
                quote_ident(column)
            ))
            .await?;
        }

        for column in &self.columns {
            if !table.require_column(column)?.nullable {
                exec.batch_execute(&format!(
                    "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
                    table_q,
                    quote_ident(column)
                ))
                .await?;
                exec.batch_execute(&format!(
                    "ALTER TABLE {} DROP CONSTRAINT {}",
                    table_q,
                    quote_ident(&self.not_null_helper(column))
                ))
                .await?;
            }
        }

        if self.kind == ConstraintKind::Unique {
            exec.batch_execute(&format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE USING INDEX {}",
                table_q,
                quote_ident(&self.name),
                quote_ident(&self.unique_index())
            ))
            .await?;
        }
        Ok(())
    }

    async fn rollback(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        let table_q = quote_qualified(ctx.schema_name, &self.table);
        if self.kind == ConstraintKind::Unique {
            exec.batch_execute(&format!(
                "DROP INDEX CONCURRENTLY IF EXISTS {}",
                quote_qualified(ctx.schema_name, &self.unique_index())
            ))
            .await?;
        }
        for column in &self.columns {
            exec.batch_execute(&format!(
                "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
                table_q,
                quote_ident(&reserved::shadow_column(column))
            ))
            .await?;
        }
        Ok(())
    }

    fn update_schema(&self, schema: &mut Schema) -> MigrateResult<()> {
        let table = schema
            .table_mut(&self.table)
            .ok_or_else(|| MigrationError::validation(format!("table '{}' not found", self.table)))?;
        match self.kind {
            ConstraintKind::Unique => {
                table.unique_constraints.insert(
                    self.name.clone(),
                    UniqueConstraint {
                        name: self.name.clone(),
                        columns: self.columns.clone(),
                    },
                );
                if self.columns.len() == 1
                    && let Some(column) = table.column_mut(&self.columns[0])
                {
                    column.unique = true;
                }
            }
            ConstraintKind::Check => {
                table.check_constraints.insert(
                    self.name.clone(),
                    CheckConstraint {
                        name: self.name.clone(),
                        columns: self.columns.clone(),
                        definition: format!(
                            "CHECK ({})",
                            self.check.clone().unwrap_or_default()
                        ),
                    },
                );
            }
            ConstraintKind::ForeignKey => {
                let references = self.references.as_ref().ok_or_else(|| {
                    MigrationError::validation(format!(
                        "foreign key '{}' requires a 'references' section",
                        self.name
                    ))
                })?;
                table.foreign_keys.insert(
                    self.name.clone(),
                    ForeignKey {
                        name: self.name.clone(),
                        columns: self.columns.clone(),
                        referenced_table: references.table.clone(),
                        referenced_columns: references.columns.clone(),
                        on_delete: references.on_delete.clone(),
                        on_update: references.on_update.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    fn project(&self, plan: &mut ViewPlan) -> MigrateResult<()> {
        let projection = plan.table_mut(&self.table)?;
        for column in &self.columns {
            projection.remap(column, reserved::shadow_column(column))?;
        }
        Ok(())
    }

    fn dual_writes(&self, ctx: &OperationContext<'_>) -> Vec<DualWriteSpec> {
        let old_columns: Vec<String> = ctx
            .schema
            .table(&self.table)
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default();

        let up_map: IndexMap<String, String> = old_columns
            .iter()
            .map(|c| (c.clone(), c.clone()))
            .collect();
        let mut down_map: IndexMap<String, String> = old_columns
            .iter()
            .map(|c| (c.clone(), c.clone()))
            .collect();
        for (logical, shadow) in self.shadow_map() {
            down_map.insert(logical, shadow);
        }

        self.columns
            .iter()
            .map(|column| DualWriteSpec {
                table: self.table.clone(),
                column: column.clone(),
                up: Some(Expression {
                    target: reserved::shadow_column(column),
                    body: self.up.get(column).cloned().unwrap_or_else(|| column.clone()),
                    map: up_map.clone(),
                }),
                down: Some(Expression {
                    target: column.clone(),
                    body: self
                        .down
                        .get(column)
                        .cloned()
                        .unwrap_or_else(|| column.clone()),
                    map: down_map.clone(),
                }),
            })
            .collect()
    }

    fn backfill_table(&self) -> Option<&str> {
        Some(&self.table)
    }

    fn transactional(&self) -> bool {
        self.kind != ConstraintKind::Unique
    }
}

#[cfg(test)]
mod tests {
    use pgroll_schema::{Column, Table};
    use pretty_assertions::assert_eq;

    use super::*;

    fn schema() -> Schema {
        let mut people = Table::new("people");
        people
            .add_column(Column::new("id", "integer").not_null())
            .unwrap();
        people.add_column(Column::new("age", "integer")).unwrap();
        people.primary_key = vec!["id".to_string()];

        let mut schema = Schema::new("public");
        schema.add_table(people).unwrap();
        schema
    }

    fn check_op() -> CreateConstraint {
        CreateConstraint {
            table: "people".to_string(),
            name: "age_positive".to_string(),
            kind: ConstraintKind::Check,
            columns: vec!["age".to_string()],
            check: Some("age > 0".to_string()),
            references: None,
            up: HashMap::from([("age".to_string(), "GREATEST(age, 1)".to_string())]),
            down: HashMap::new(),
        }
    }

    #[test]
    fn test_validate_check_requires_expression() {
        let mut op = check_op();
        op.check = None;
        assert!(op.validate(&schema()).is_err());
        assert!(check_op().validate(&schema()).is_ok());
    }

    #[test]
    fn test_validate_foreign_key_column_counts() {
        let mut schema = schema();
        let mut orders = Table::new("orders");
        orders
            .add_column(Column::new("person_id", "integer"))
            .unwrap();
        schema.add_table(orders).unwrap();

        let op = CreateConstraint {
            table: "orders".to_string(),
            name: "orders_person_fk".to_string(),
            kind: ConstraintKind::ForeignKey,
            columns: vec!["person_id".to_string()],
            check: None,
            references: Some(ForeignKeyReference {
                table: "people".to_string(),
                columns: vec!["id".to_string()],
                on_delete: Some("CASCADE".to_string()),
                on_update: None,
            }),
            up: HashMap::new(),
            down: HashMap::new(),
        };
        assert!(op.validate(&schema).is_ok());

        let mut mismatched = op.clone();
        mismatched.references.as_mut().unwrap().columns.push("id".to_string());
        assert!(mismatched.validate(&schema).is_err());
    }

    #[test]
    fn test_dual_writes_scrub_through_up_expression() {
        let schema = schema();
        let ctx = OperationContext {
            schema_name: "public",
            state_schema: "pgroll",
            new_version_schema: "public_02_check_age",
            old_version_schema: Some("public_01_init"),
            schema: &schema,
        };

        let specs = check_op().dual_writes(&ctx);
        assert_eq!(specs.len(), 1);
        let up = specs[0].up.as_ref().unwrap();
        assert_eq!(up.target, "_pgroll_new_age");
        assert_eq!(up.body, "GREATEST(age, 1)");
        // Identity down when unspecified.
        let down = specs[0].down.as_ref().unwrap();
        assert_eq!(down.body, "age");
        assert_eq!(down.map["age"], "_pgroll_new_age");
    }

    #[test]
    fn test_project_remaps_constrained_columns() {
        let mut plan = ViewPlan::identity(&schema());
        check_op().project(&mut plan).unwrap();
        assert_eq!(
            plan.table("people").unwrap().columns["age"],
            "_pgroll_new_age"
        );
    }

    #[test]
    fn test_unique_constraint_is_not_transactional() {
        let mut op = check_op();
        op.kind = ConstraintKind::Unique;
        assert!(!op.transactional());
        assert!(check_op().transactional());
    }

    #[test]
    fn test_update_schema_records_constraint() {
        let mut schema = schema();
        check_op().update_schema(&mut schema).unwrap();
        assert!(
            schema
                .table("people")
                .unwrap()
                .check_constraints
                .contains_key("age_positive")
        );
    }

    #[test]
    fn test_requires_backfill() {
        assert_eq!(check_op().backfill_table(), Some("people"));
    }
}
