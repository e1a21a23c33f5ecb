//! The versioned view layer.
//!
//! Each migration version materializes as one database schema full of
//! views. A view projects a physical table into the column shape that
//! version exposes: every user-facing column name maps to exactly one
//! physical column. Clients select a version by putting its schema on
//! their `search_path`.

use indexmap::IndexMap;
use pgroll_postgres::{Executor, PgTransaction};
use pgroll_schema::{Schema, reserved};
use tracing::debug;

use crate::error::{MigrateResult, MigrationError};
use crate::sql::{quote_ident, quote_qualified};

/// First server version that understands `security_invoker` on views.
pub const SECURITY_INVOKER_MIN_VERSION: i32 = 150000;

/// The database schema name of one migration version.
pub fn version_schema_name(schema: &str, migration: &str) -> String {
    format!("{}_{}", schema, migration)
}

/// The projection of one physical table into one version's view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableProjection {
    /// Physical table name.
    pub table: String,
    /// Map of user-facing column name to physical column name, in view
    /// column order.
    pub columns: IndexMap<String, String>,
}

impl TableProjection {
    /// Identity projection over a table's logical columns.
    pub fn identity(table: &pgroll_schema::Table) -> Self {
        let columns = table
            .columns
            .iter()
            .filter(|c| !reserved::is_reserved(&c.name))
            .map(|c| (c.name.clone(), c.name.clone()))
            .collect();
        Self {
            table: table.name.clone(),
            columns,
        }
    }

    /// Expose a physical column under a user-facing name.
    pub fn expose(&mut self, logical: impl Into<String>, physical: impl Into<String>) {
        self.columns.insert(logical.into(), physical.into());
    }

    /// Hide a column from the view.
    pub fn hide(&mut self, logical: &str) {
        self.columns.shift_remove(logical);
    }

    /// Rename the user-facing name of a column, keeping its position.
    pub fn rename(&mut self, from: &str, to: impl Into<String>) -> MigrateResult<()> {
        let to = to.into();
        if self.columns.contains_key(&to) {
            return Err(MigrationError::validation(format!(
                "view for table '{}' already exposes column '{}'",
                self.table, to
            )));
        }
        let index = self.columns.get_index_of(from).ok_or_else(|| {
            MigrationError::validation(format!(
                "view for table '{}' does not expose column '{}'",
                self.table, from
            ))
        })?;
        let (_, physical) = self.columns.shift_remove_index(index).expect("index exists");
        self.columns.shift_insert(index, to, physical);
        Ok(())
    }

    /// Point a user-facing name at a different physical column.
    pub fn remap(&mut self, logical: &str, physical: impl Into<String>) -> MigrateResult<()> {
        match self.columns.get_mut(logical) {
            Some(slot) => {
                *slot = physical.into();
                Ok(())
            }
            None => Err(MigrationError::validation(format!(
                "view for table '{}' does not expose column '{}'",
                self.table, logical
            ))),
        }
    }

    /// Render the view DDL for this projection.
    fn render(&self, schema: &str, version_schema: &str, logical: &str, invoker: bool) -> String {
        let select_list = if self.columns.is_empty() {
            // A table with every column hidden still gets a view so row
            // existence remains observable.
            "1 AS \"_placeholder\"".to_string()
        } else {
            self.columns
                .iter()
                .map(|(logical, physical)| {
                    if logical == physical {
                        quote_ident(physical)
                    } else {
                        format!("{} AS {}", quote_ident(physical), quote_ident(logical))
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        let options = if invoker {
            " WITH (security_invoker = true)"
        } else {
            ""
        };

        format!(
            "CREATE VIEW {}{} AS SELECT {} FROM {}",
            quote_qualified(version_schema, logical),
            options,
            select_list,
            quote_qualified(schema, &self.table),
        )
    }
}

/// The full set of view projections for one version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewPlan {
    tables: IndexMap<String, TableProjection>,
}

impl ViewPlan {
    /// Identity plan over a schema: one view per table, all logical
    /// columns mapped to themselves.
    pub fn identity(schema: &Schema) -> Self {
        let tables = schema
            .tables
            .values()
            .map(|t| (t.name.clone(), TableProjection::identity(t)))
            .collect();
        Self { tables }
    }

    /// The projection for a user-facing table name.
    pub fn table(&self, name: &str) -> Option<&TableProjection> {
        self.tables.get(name)
    }

    /// The projection for a user-facing table name, mutably.
    pub fn table_mut(&mut self, name: &str) -> MigrateResult<&mut TableProjection> {
        self.tables.get_mut(name).ok_or_else(|| {
            MigrationError::validation(format!("no view projection for table '{}'", name))
        })
    }

    /// Add a projection for a new table.
    pub fn add_table(&mut self, logical: impl Into<String>, projection: TableProjection) {
        self.tables.insert(logical.into(), projection);
    }

    /// Remove a table from the version.
    pub fn remove_table(&mut self, logical: &str) {
        self.tables.shift_remove(logical);
    }

    /// Rename the user-facing name of a table.
    pub fn rename_table(&mut self, from: &str, to: impl Into<String>) -> MigrateResult<()> {
        let to = to.into();
        if self.tables.contains_key(&to) {
            return Err(MigrationError::validation(format!(
                "version already exposes table '{}'",
                to
            )));
        }
        let index = self.tables.get_index_of(from).ok_or_else(|| {
            MigrationError::validation(format!("no view projection for table '{}'", from))
        })?;
        let (_, projection) = self.tables.shift_remove_index(index).expect("index exists");
        self.tables.shift_insert(index, to, projection);
        Ok(())
    }

    /// User-facing table names in plan order.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Iterate projections with their user-facing names.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TableProjection)> {
        self.tables.iter().map(|(name, p)| (name.as_str(), p))
    }
}

/// Create or refresh the schema-of-views for one version.
///
/// Runs inside the caller's transaction: the schema is created if absent,
/// every view in the plan is dropped and recreated (a replace cannot
/// change a view column's order or type, and promotions do both), and
/// views no longer in the plan are dropped. Observers see the swap
/// atomically at commit.
pub async fn create_version_views(
    tx: &PgTransaction<'_>,
    schema: &str,
    version_schema: &str,
    plan: &ViewPlan,
    security_invoker: bool,
) -> MigrateResult<()> {
    debug!(version = %version_schema, tables = plan.tables.len(), "Writing version views");

    tx.batch_execute(&format!(
        "CREATE SCHEMA IF NOT EXISTS {}",
        quote_ident(version_schema)
    ))
    .await?;

    for (logical, projection) in plan.iter() {
        tx.batch_execute(&format!(
            "DROP VIEW IF EXISTS {}",
            quote_qualified(version_schema, logical)
        ))
        .await?;
        let ddl = projection.render(schema, version_schema, logical, security_invoker);
        tx.batch_execute(&ddl).await?;
    }

    // Drop views the plan no longer names.
    let rows = tx
        .query(
            "SELECT viewname FROM pg_views WHERE schemaname = $1",
            &[&version_schema],
        )
        .await?;
    for row in rows {
        let existing: String = row.get("viewname");
        if plan.table(&existing).is_none() {
            tx.batch_execute(&format!(
                "DROP VIEW IF EXISTS {}",
                quote_qualified(version_schema, &existing)
            ))
            .await?;
        }
    }

    tx.batch_execute(&format!(
        "GRANT USAGE ON SCHEMA {} TO public",
        quote_ident(version_schema)
    ))
    .await?;

    Ok(())
}

/// Drop one version's schema-of-views entirely.
pub async fn drop_version_schema(exec: &Executor<'_>, version_schema: &str) -> MigrateResult<()> {
    debug!(version = %version_schema, "Dropping version schema");
    exec.batch_execute(&format!(
        "DROP SCHEMA IF EXISTS {} CASCADE",
        quote_ident(version_schema)
    ))
    .await?;
    Ok(())
}
