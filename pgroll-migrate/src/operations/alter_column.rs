//! Alter a column.

use async_trait::async_trait;
use indexmap::IndexMap;
use pgroll_postgres::Executor;
use pgroll_schema::{CheckConstraint, Schema, UniqueConstraint, reserved};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{MigrateResult, MigrationError};
use crate::operations::{Operation, OperationContext};
use crate::sql::{check_identifier, quote_ident, quote_literal, quote_qualified};
use crate::trigger::{DualWriteSpec, Expression, substitute_columns};
use crate::views::ViewPlan;

/// A named check constraint attached by an alter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckDef {
    /// Constraint name.
    pub name: String,
    /// Check expression over the column's logical name.
    pub constraint: String,
}

/// Alter a column: rename, change type, nullability, default, uniqueness,
/// or attach a check constraint — in any combination.
///
/// A pure rename is a view-layer change until `complete`. Everything else
/// expands into a shadow column with the new shape: the shadow carries the
/// declared constraints as `NOT VALID`, a dual-write trigger keeps both
/// columns in sync through the `up`/`down` expressions, the backfill fills
/// the shadow for pre-existing rows, and `complete` validates, drops the
/// original, and promotes the shadow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlterColumn {
    /// Table the column lives on.
    pub table: String,
    /// Column to alter.
    pub column: String,
    /// New column name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New SQL type.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    /// New nullability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    /// New default value (quoted as a literal).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Add a single-column unique constraint.
    #[serde(default)]
    pub unique: bool,
    /// Attach a check constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckDef>,
    /// Expression computing the new-shape value from the old row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up: Option<String>,
    /// Expression computing the old-shape value from the new row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<String>,
}

impl AlterColumn {
    /// Whether the alter needs a shadow column.
    fn shadowed(&self) -> bool {
        self.data_type.is_some()
            || self.nullable.is_some()
            || self.default.is_some()
            || self.unique
            || self.check.is_some()
    }

    /// The column's user-facing name in the new version.
    fn final_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.column)
    }

    fn shadow(&self) -> String {
        reserved::shadow_column(&self.column)
    }

    fn not_null_constraint(&self) -> String {
        format!("_pgroll_check_not_null_{}", self.column)
    }

    fn unique_index(&self) -> String {
        format!("_pgroll_unique_{}_{}", self.table, self.column)
    }
}

#[async_trait]
impl Operation for AlterColumn {
    fn name(&self) -> &'static str {
        "alter_column"
    }

    fn validate(&self, schema: &Schema) -> MigrateResult<()> {
        let table = schema.require_table(&self.table)?;
        table.require_column(&self.column)?;

        if let Some(new_name) = &self.name {
            check_identifier(new_name)?;
            if table.has_column(new_name) {
                return Err(MigrationError::validation(format!(
                    "column '{}' already exists on table '{}'",
                    new_name, self.table
                )));
            }
        }

        if self.shadowed() {
            if self.up.is_none() || self.down.is_none() {
                return Err(MigrationError::validation(format!(
                    "altering column '{}' requires both 'up' and 'down' expressions",
                    self.column
                )));
            }
        } else if self.name.is_none() {
            return Err(MigrationError::validation(format!(
                "alter_column on '{}' declares no changes",
                self.column
            )));
        }

        if let Some(check) = &self.check {
            check_identifier(&check.name)?;
        }
        Ok(())
    }

    async fn start(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        if !self.shadowed() {
            return Ok(());
        }
        let table_q = quote_qualified(ctx.schema_name, &self.table);
        let shadow = self.shadow();
        let shadow_q = quote_ident(&shadow);

        let data_type = match &self.data_type {
            Some(t) => t.clone(),
            None => {
                ctx.schema
                    .require_table(&self.table)?
                    .require_column(&self.column)?
                    .data_type
                    .clone()
            }
        };

        let mut ddl = format!("ALTER TABLE {} ADD COLUMN {} {}", table_q, shadow_q, data_type);
        if let Some(default) = &self.default {
            ddl.push_str(&format!(" DEFAULT {}", quote_literal(default)));
        }
        exec.batch_execute(&ddl).await?;

        if self.nullable == Some(false) {
            exec.batch_execute(&format!(
                "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({} IS NOT NULL) NOT VALID",
                table_q,
                quote_ident(&self.not_null_constraint()),
                shadow_q
            ))
            .await?;
        }

        if let Some(check) = &self.check {
            let map = IndexMap::from([
                (self.column.clone(), shadow.clone()),
                (self.final_name().to_string(), shadow.clone()),
            ]);
            exec.batch_execute(&format!(
                "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({}) NOT VALID",
                table_q,
                quote_ident(&check.name),
                substitute_columns(&check.constraint, &map)
            ))
            .await?;
        }

        if self.unique {
            exec.batch_execute(&format!(
                "CREATE UNIQUE INDEX CONCURRENTLY IF NOT EXISTS {} ON {} ({})",
                quote_ident(&self.unique_index()),
                table_q,
                shadow_q
            ))
            .await?;
        }
        Ok(())
    }

    async fn complete(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        let table_q = quote_qualified(ctx.schema_name, &self.table);

        if !self.shadowed() {
            exec.batch_execute(&format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                table_q,
                quote_ident(&self.column),
                quote_ident(self.final_name())
            ))
            .await?;
            return Ok(());
        }

        if self.nullable == Some(false) {
            exec.batch_execute(&format!(
                "ALTER TABLE {} VALIDATE CONSTRAINT {}",
                table_q,
                quote_ident(&self.not_null_constraint())
            ))
            .await?;
        }
        if let Some(check) = &self.check {
            exec.batch_execute(&format!(
                "ALTER TABLE {} VALIDATE CONSTRAINT {}",
                table_q,
                quote_ident(&check.name)
            ))
            .await?;
        }

        exec.batch_execute(&format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
            table_q,
            quote_ident(&self.column)
        ))
        .await?;
        exec.batch_execute(&format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            table_q,
            quote_ident(&self.shadow()),
            quote_ident(self.final_name())
        ))
        .await?;

        if self.nullable == Some(false) {
            let constraint = quote_ident(&self.not_null_constraint());
            exec.batch_execute(&format!(
                "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
                table_q,
                quote_ident(self.final_name())
            ))
            .await?;
            exec.batch_execute(&format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                table_q, constraint
            ))
            .await?;
        }

        if self.unique {
            exec.batch_execute(&format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE USING INDEX {}",
                table_q,
                quote_ident(&format!("{}_{}_key", self.table, self.final_name())),
                quote_ident(&self.unique_index())
            ))
            .await?;
        }
        Ok(())
    }

    async fn rollback(&self, exec: &Executor<'_>, ctx: &OperationContext<'_>) -> MigrateResult<()> {
        if !self.shadowed() {
            return Ok(());
        }
        exec.batch_execute(&format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
            quote_qualified(ctx.schema_name, &self.table),
            quote_ident(&self.shadow())
        ))
        .await?;
        Ok(())
    }

    fn update_schema(&self, schema: &mut Schema) -> MigrateResult<()> {
        let table = schema
            .table_mut(&self.table)
            .ok_or_else(|| MigrationError::validation(format!("table '{}' not found", self.table)))?;

        if let Some(new_name) = &self.name {
            table.rename_column(&self.column, new_name)?;
        }
        let final_name = self.final_name().to_string();

        if self.unique {
            let name = format!("{}_{}_key", self.table, final_name);
            table.unique_constraints.insert(
                name.clone(),
                UniqueConstraint {
                    name,
                    columns: vec![final_name.clone()],
                },
            );
        }
        if let Some(check) = &self.check {
            table.check_constraints.insert(
                check.name.clone(),
                CheckConstraint {
                    name: check.name.clone(),
                    columns: vec![final_name.clone()],
                    definition: format!("CHECK ({})", check.constraint),
                },
            );
        }

        let column = table
            .column_mut(&final_name)
            .ok_or_else(|| MigrationError::validation(format!("column '{}' not found", final_name)))?;
        if let Some(data_type) = &self.data_type {
            column.data_type = data_type.clone();
        }
        if let Some(nullable) = self.nullable {
            column.nullable = nullable;
        }
        if let Some(default) = &self.default {
            column.default = Some(default.clone());
        }
        if self.unique {
            column.unique = true;
        }
        Ok(())
    }

    fn project(&self, plan: &mut ViewPlan) -> MigrateResult<()> {
        let projection = plan.table_mut(&self.table)?;
        if let Some(new_name) = &self.name {
            projection.rename(&self.column, new_name)?;
        }
        if self.shadowed() {
            projection.remap(self.final_name(), self.shadow())?;
        }
        Ok(())
    }

    fn dual_writes(&self, ctx: &OperationContext<'_>) -> Vec<DualWriteSpec> {
        if !self.shadowed() {
            return Vec::new();
        }
        let (Some(up), Some(down)) = (&self.up, &self.down) else {
            return Vec::new();
        };

        let old_columns: Vec<String> = ctx
            .schema
            .table(&self.table)
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default();

        // Old-version writers: expression over old names, filling the
        // shadow.
        let up_map: IndexMap<String, String> = old_columns
            .iter()
            .map(|c| (c.clone(), c.clone()))
            .collect();

        // New-version writers: the altered column resolves to the shadow
        // under its new-version name, everything else is unchanged.
        let mut down_map: IndexMap<String, String> = old_columns
            .iter()
            .filter(|c| **c != self.column)
            .map(|c| (c.clone(), c.clone()))
            .collect();
        down_map.insert(self.final_name().to_string(), self.shadow());

        vec![DualWriteSpec {
            table: self.table.clone(),
            column: self.column.clone(),
            up: Some(Expression {
                target: self.shadow(),
                body: up.clone(),
                map: up_map,
            }),
            down: Some(Expression {
                target: self.column.clone(),
                body: down.clone(),
                map: down_map,
            }),
        }]
    }

    fn backfill_table(&self) -> Option<&str> {
        if self.shadowed() {
            Some(&self.table)
        } else {
            None
        }
    }

    fn column_renames(&self) -> HashMap<String, HashMap<String, String>> {
        match &self.name {
            Some(new_name) => HashMap::from([(
                self.table.clone(),
                HashMap::from([(self.column.clone(), new_name.clone())]),
            )]),
            None => HashMap::new(),
        }
    }

    fn transactional(&self) -> bool {
        !self.unique
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
            .add_column(Column::new("name", "character varying(255)"))
            .unwrap();
        table.primary_key = vec!["id".to_string()];
        let mut schema = Schema::new("public");
        schema.add_table(table).unwrap();
        schema
    }

    fn set_not_null() -> AlterColumn {
        AlterColumn {
            table: "users".to_string(),
            column: "name".to_string(),
            name: None,
            data_type: None,
            nullable: Some(false),
            default: None,
            unique: false,
            check: None,
            up: Some("COALESCE(name, 'placeholder')".to_string()),
            down: Some("name".to_string()),
        }
    }

    fn rename_only() -> AlterColumn {
        AlterColumn {
            table: "users".to_string(),
            column: "name".to_string(),
            name: Some("full_name".to_string()),
            data_type: None,
            nullable: None,
            default: None,
            unique: false,
            check: None,
            up: None,
            down: None,
        }
    }

    #[test]
    fn test_validate_shadowed_requires_up_and_down() {
        let mut op = set_not_null();
        op.up = None;
        assert!(op.validate(&schema()).is_err());
        assert!(set_not_null().validate(&schema()).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_alter() {
        let mut op = rename_only();
        op.name = None;
        assert!(op.validate(&schema()).is_err());
    }

    #[test]
    fn test_rename_only_has_no_shadow() {
        let op = rename_only();
        assert!(!op.shadowed());
        assert!(op.backfill_table().is_none());
        assert!(op.transactional());

        let renames = op.column_renames();
        assert_eq!(renames["users"]["name"], "full_name");
    }

    #[test]
    fn test_shadowed_alter_requires_backfill() {
        assert_eq!(set_not_null().backfill_table(), Some("users"));
    }

    #[test]
    fn test_project_rename_and_shadow() {
        let mut op = set_not_null();
        op.name = Some("full_name".to_string());
        let mut plan = ViewPlan::identity(&schema());
        op.project(&mut plan).unwrap();

        let projection = plan.table("users").unwrap();
        assert!(!projection.columns.contains_key("name"));
        assert_eq!(projection.columns["full_name"], "_pgroll_new_name");
    }

    #[test]
    fn test_dual_writes_map_both_directions() {
        let schema = schema();
        let ctx = OperationContext {
            schema_name: "public",
            state_schema: "pgroll",
            new_version_schema: "public_02_set_not_null",
            old_version_schema: Some("public_01_init"),
            schema: &schema,
        };

        let specs = set_not_null().dual_writes(&ctx);
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];

        let up = spec.up.as_ref().unwrap();
        assert_eq!(up.target, "_pgroll_new_name");
        assert_eq!(up.map["name"], "name");

        let down = spec.down.as_ref().unwrap();
        assert_eq!(down.target, "name");
        assert_eq!(down.map["name"], "_pgroll_new_name");
        assert_eq!(down.map["id"], "id");
    }

    #[test]
    fn test_update_schema_applies_new_shape() {
        let mut schema = schema();
        let mut op = set_not_null();
        op.name = Some("full_name".to_string());
        op.update_schema(&mut schema).unwrap();

        let table = schema.table("users").unwrap();
        assert!(table.column("name").is_none());
        let column = table.column("full_name").unwrap();
        assert!(!column.nullable);
    }

    #[test]
    fn test_unique_alter_is_not_transactional() {
        let mut op = set_not_null();
        op.unique = true;
        assert!(!op.transactional());
    }
}
