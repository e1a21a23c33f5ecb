//! The engine's state store.
//!
//! A reserved schema in the target database holds migration history,
//! per-migration schema snapshots, and the SQL functions clients use to
//! discover versions. History is append-only: `complete` and `rollback`
//! flip terminal flags, they never delete rows.

use pgroll_postgres::{PgPool, PgTransaction};
use pgroll_schema::Schema;
use serde_json::Value;
use tokio_postgres::Row;
use tracing::{debug, info};

use crate::error::{MigrateResult, MigrationError};
use crate::migration::{Migration, MigrationRecord, MigrationState};
use crate::sql::{quote_ident, quote_literal, quote_qualified};

/// Version stamp written at init; a strictly greater stored value means a
/// newer engine owns the state schema.
pub const STATE_VERSION: i32 = 1;

/// Default name of the reserved state schema.
pub const DEFAULT_STATE_SCHEMA: &str = "pgroll";

/// Access to the reserved state schema.
#[derive(Clone)]
pub struct StateStore {
    pool: PgPool,
    schema: String,
}

impl StateStore {
    /// Create a state store over the given pool.
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// The state schema name.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Initialize the state schema. Idempotent.
    ///
    /// Fails if the state schema was created by a strictly newer engine.
    pub async fn init(&self) -> MigrateResult<()> {
        if let Some(found) = self.stored_version().await? {
            if found > STATE_VERSION {
                return Err(MigrationError::AlreadyInitializedWithNewerVersion {
                    found,
                    supported: STATE_VERSION,
                });
            }
            debug!(version = found, "State schema already initialized");
        }

        let conn = self.pool.get().await?;
        conn.batch_execute(&init_sql(&self.schema)).await?;
        info!(schema = %self.schema, "State schema initialized");
        Ok(())
    }

    /// Whether the state schema exists.
    pub async fn is_initialized(&self) -> MigrateResult<bool> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "SELECT to_regclass($1) IS NOT NULL AS present",
                &[&quote_qualified(&self.schema, "migrations")],
            )
            .await?;
        Ok(row.get("present"))
    }

    /// The version stamp left by a previous init, if any.
    async fn stored_version(&self) -> MigrateResult<Option<i32>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "SELECT to_regclass($1) IS NOT NULL AS present",
                &[&quote_qualified(&self.schema, "pgroll_version")],
            )
            .await?;
        let present: bool = row.get("present");
        if !present {
            return Ok(None);
        }
        let row = conn
            .query_one(
                &format!(
                    "SELECT max(version) AS version FROM {}",
                    quote_qualified(&self.schema, "pgroll_version")
                ),
                &[],
            )
            .await?;
        Ok(row.get("version"))
    }

    /// The in-progress migration for a logical schema, if any.
    pub async fn active_migration(&self, schema: &str) -> MigrateResult<Option<MigrationRecord>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT name, parent, migration, resulting_schema, done, rolled_back, \
                     created_at, updated_at \
                     FROM {} WHERE schema = $1 AND NOT done AND NOT rolled_back",
                    quote_qualified(&self.schema, "migrations")
                ),
                &[&schema],
            )
            .await?;
        row.map(record_from_row).transpose()
    }
}

/// DDL for the state schema, history table, and helper functions.
pub fn init_sql(state_schema: &str) -> String {
    let schema = quote_ident(state_schema);
    let migrations = quote_qualified(state_schema, "migrations");
    let version_table = quote_qualified(state_schema, "pgroll_version");
    let schema_literal = quote_literal(state_schema);

    format!(
        r#"
CREATE SCHEMA IF NOT EXISTS {schema};

CREATE TABLE IF NOT EXISTS {migrations} (
    schema            NAME NOT NULL,
    name              TEXT NOT NULL,
    parent            TEXT,
    migration         JSONB NOT NULL,
    resulting_schema  JSONB,
    done              BOOLEAN NOT NULL DEFAULT false,
    rolled_back       BOOLEAN NOT NULL DEFAULT false,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (schema, name),
    FOREIGN KEY (schema, parent) REFERENCES {migrations} (schema, name)
);

CREATE INDEX IF NOT EXISTS "migrations_active_idx"
    ON {migrations} (schema) WHERE NOT done AND NOT rolled_back;

CREATE TABLE IF NOT EXISTS {version_table} (
    version        INTEGER NOT NULL,
    initialized_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

INSERT INTO {version_table} (version)
SELECT {state_version}
WHERE NOT EXISTS (SELECT 1 FROM {version_table} WHERE version = {state_version});

CREATE OR REPLACE FUNCTION {schema}.latest_version(schemaname NAME) RETURNS TEXT
LANGUAGE sql
STABLE
SET search_path = {schema_literal}, pg_catalog, pg_temp
AS $pgroll$
    SELECT m.name
    FROM migrations m
    WHERE m.schema = schemaname AND m.done
      AND NOT EXISTS (
          SELECT 1 FROM migrations c
          WHERE c.schema = m.schema AND c.parent = m.name AND c.done
      )
$pgroll$;

CREATE OR REPLACE FUNCTION {schema}.is_active_migration_period(schemaname NAME) RETURNS BOOLEAN
LANGUAGE sql
STABLE
SET search_path = {schema_literal}, pg_catalog, pg_temp
AS $pgroll$
    SELECT EXISTS (
        SELECT 1 FROM migrations
        WHERE schema = schemaname AND NOT done AND NOT rolled_back
    )
$pgroll$;
"#,
            schema = schema,
            migrations = migrations,
            version_table = version_table,
            schema_literal = schema_literal,
            state_version = STATE_VERSION,
        )
}

impl StateStore {
    /// The name of the most recent completed migration, if any.
    pub async fn latest_version(&self, schema: &str) -> MigrateResult<Option<String>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                &format!(
                    "SELECT {}.latest_version($1) AS name",
                    quote_ident(&self.schema)
                ),
                &[&schema],
            )
            .await?;
        Ok(row.get("name"))
    }

    /// The persisted schema snapshot of the most recent completed
    /// migration, if any.
    pub async fn latest_schema(&self, schema: &str) -> MigrateResult<Option<Schema>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT resulting_schema FROM {} \
                     WHERE schema = $1 AND name = {}.latest_version($1)",
                    quote_qualified(&self.schema, "migrations"),
                    quote_ident(&self.schema)
                ),
                &[&schema],
            )
            .await?;
        match row {
            Some(row) => {
                let value: Option<Value> = row.get("resulting_schema");
                value
                    .map(|v| serde_json::from_value(v).map_err(MigrationError::from))
                    .transpose()
            }
            None => Ok(None),
        }
    }

    /// Record the start of a migration.
    pub async fn start_migration(
        &self,
        schema: &str,
        migration: &Migration,
        parent: Option<&str>,
    ) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        let document = serde_json::to_value(migration)?;
        conn.execute(
            &format!(
                "INSERT INTO {} (schema, name, parent, migration) VALUES ($1, $2, $3, $4)",
                quote_qualified(&self.schema, "migrations")
            ),
            &[&schema, &migration.name, &parent, &document],
        )
        .await?;
        debug!(schema = %schema, migration = %migration.name, "Migration recorded as in progress");
        Ok(())
    }

    /// Mark the active migration complete, within the caller's transaction.
    pub async fn complete_migration(
        &self,
        tx: &PgTransaction<'_>,
        schema: &str,
        name: &str,
        resulting_schema: &Schema,
    ) -> MigrateResult<()> {
        let snapshot = serde_json::to_value(resulting_schema)?;
        let updated = tx
            .execute(
                &format!(
                    "UPDATE {} SET done = true, resulting_schema = $3, updated_at = now() \
                     WHERE schema = $1 AND name = $2 AND NOT done AND NOT rolled_back",
                    quote_qualified(&self.schema, "migrations")
                ),
                &[&schema, &name, &snapshot],
            )
            .await?;
        if updated != 1 {
            return Err(MigrationError::invariant(format!(
                "expected one in-progress history row for '{}', found {}",
                name, updated
            )));
        }
        Ok(())
    }

    /// Mark the active migration rolled back.
    pub async fn rollback_migration(&self, schema: &str, name: &str) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "UPDATE {} SET rolled_back = true, updated_at = now() \
                 WHERE schema = $1 AND name = $2 AND NOT done AND NOT rolled_back",
                quote_qualified(&self.schema, "migrations")
            ),
            &[&schema, &name],
        )
        .await?;
        Ok(())
    }

    /// Refresh the persisted schema snapshot of a completed migration.
    pub async fn update_resulting_schema(
        &self,
        schema: &str,
        name: &str,
        resulting_schema: &Schema,
    ) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        let snapshot = serde_json::to_value(resulting_schema)?;
        conn.execute(
            &format!(
                "UPDATE {} SET resulting_schema = $3, updated_at = now() \
                 WHERE schema = $1 AND name = $2 AND done",
                quote_qualified(&self.schema, "migrations")
            ),
            &[&schema, &name, &snapshot],
        )
        .await?;
        Ok(())
    }

    /// Record a baseline: a completed history row with no operations,
    /// whose snapshot is the given reflected schema.
    pub async fn baseline(
        &self,
        schema: &str,
        name: &str,
        parent: Option<&str>,
        reflected: &Schema,
    ) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        let migration = Migration::new(name, Vec::new());
        let document = serde_json::to_value(&migration)?;
        let snapshot = serde_json::to_value(reflected)?;
        conn.execute(
            &format!(
                "INSERT INTO {} (schema, name, parent, migration, resulting_schema, done) \
                 VALUES ($1, $2, $3, $4, $5, true)",
                quote_qualified(&self.schema, "migrations")
            ),
            &[&schema, &name, &parent, &document, &snapshot],
        )
        .await?;
        info!(schema = %schema, migration = %name, "Baseline recorded");
        Ok(())
    }

    /// Whether a migration with this name exists in history.
    pub async fn migration_exists(&self, schema: &str, name: &str) -> MigrateResult<bool> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                &format!(
                    "SELECT EXISTS (SELECT 1 FROM {} WHERE schema = $1 AND name = $2) AS present",
                    quote_qualified(&self.schema, "migrations")
                ),
                &[&schema, &name],
            )
            .await?;
        Ok(row.get("present"))
    }

    /// The full migration history for a logical schema, oldest first.
    pub async fn history(&self, schema: &str) -> MigrateResult<Vec<MigrationRecord>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT name, parent, migration, resulting_schema, done, rolled_back, \
                     created_at, updated_at \
                     FROM {} WHERE schema = $1 ORDER BY created_at, name",
                    quote_qualified(&self.schema, "migrations")
                ),
                &[&schema],
            )
            .await?;
        rows.into_iter().map(record_from_row).collect()
    }
}

/// Convert a history row into a record.
fn record_from_row(row: Row) -> MigrateResult<MigrationRecord> {
    let document: Value = row.get("migration");
    let migration: Migration = serde_json::from_value(document)?;
    let snapshot: Option<Value> = row.get("resulting_schema");
    let resulting_schema = snapshot
        .map(|v| serde_json::from_value(v))
        .transpose()
        .map_err(MigrationError::from)?;

    let done: bool = row.get("done");
    let rolled_back: bool = row.get("rolled_back");
    let state = if done {
        MigrationState::Complete
    } else if rolled_back {
        MigrationState::RolledBack
    } else {
        MigrationState::InProgress
    };

    Ok(MigrationRecord {
        name: row.get("name"),
        parent: row.get("parent"),
        migration,
        state,
        resulting_schema,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_sql_creates_history_and_functions() {
        let sql = init_sql(DEFAULT_STATE_SCHEMA);
        assert!(sql.contains("CREATE SCHEMA IF NOT EXISTS \"pgroll\""));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS \"pgroll\".\"migrations\""));
        assert!(sql.contains("rolled_back"));
        assert!(sql.contains("latest_version"));
        assert!(sql.contains("is_active_migration_period"));
    }

    #[test]
    fn test_init_sql_is_idempotent_ddl() {
        let sql = init_sql(DEFAULT_STATE_SCHEMA);
        // Re-running init must not fail on existing objects.
        assert!(!sql.contains("CREATE TABLE \"pgroll\""));
        assert!(sql.matches("IF NOT EXISTS").count() >= 4);
        assert!(sql.contains("CREATE OR REPLACE FUNCTION"));
    }

    #[test]
    fn test_init_sql_quotes_custom_schema() {
        let sql = init_sql("my state");
        assert!(sql.contains("\"my state\".\"migrations\""));
    }

    #[test]
    fn test_init_sql_stamps_current_version() {
        let sql = init_sql(DEFAULT_STATE_SCHEMA);
        assert!(sql.contains(&format!("SELECT {}", STATE_VERSION)));
    }
}
