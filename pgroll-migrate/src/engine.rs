//! Migration engine implementation.
//!
//! The engine drives one migration at a time through the three-phase
//! state machine: `start` expands the schema so the old and new versions
//! coexist, `complete` contracts to the new version, `rollback` returns
//! to the old. Between `start` and a terminal phase both version schemas
//! stay queryable for an arbitrarily long overlap period.

use std::time::Duration;

use indexmap::IndexMap;
use pgroll_postgres::{DirectConnection, Executor, PgPool, PgTransaction};
use pgroll_schema::{Schema, SchemaReflector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backfill::{Backfill, BackfillConfig, BackfillStrategy, Progress};
use crate::error::{MigrateResult, MigrationError};
use crate::migration::{Migration, MigrationRecord};
use crate::operations::{Operation, OperationContext};
use crate::sql::quote_ident;
use crate::state::{DEFAULT_STATE_SCHEMA, StateStore};
use crate::trigger;
use crate::views::{self, SECURITY_INVOKER_MIN_VERSION, ViewPlan, version_schema_name};

/// Configuration for the migration engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Logical schema the engine migrates.
    pub schema: String,
    /// Name of the reserved state schema.
    pub state_schema: String,
    /// `lock_timeout` applied to every DDL transaction, so blocked DDL
    /// fails fast instead of queueing behind long readers.
    pub lock_timeout: Duration,
    /// Role every engine transaction switches to, when set.
    pub role: Option<String>,
    /// Backfill tuning.
    pub backfill: BackfillConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            state_schema: DEFAULT_STATE_SCHEMA.to_string(),
            lock_timeout: Duration::from_millis(500),
            role: None,
            backfill: BackfillConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the logical schema.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the state schema name.
    pub fn state_schema(mut self, schema: impl Into<String>) -> Self {
        self.state_schema = schema.into();
        self
    }

    /// Set the DDL lock timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Run engine transactions under a role.
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the backfill configuration.
    pub fn backfill(mut self, backfill: BackfillConfig) -> Self {
        self.backfill = backfill;
        self
    }
}

/// Migration status information.
#[derive(Debug)]
pub struct MigrationStatus {
    /// Logical schema.
    pub schema: String,
    /// Most recent completed migration, if any.
    pub latest_version: Option<String>,
    /// Name of the in-progress migration, if any.
    pub active: Option<String>,
    /// Full history, oldest first.
    pub history: Vec<MigrationRecord>,
}

/// The migration engine.
pub struct Engine {
    pool: PgPool,
    config: EngineConfig,
    state: StateStore,
    reflector: SchemaReflector,
}

impl Engine {
    /// Create an engine over a connection pool.
    pub fn new(pool: PgPool, config: EngineConfig) -> Self {
        let state = StateStore::new(pool.clone(), config.state_schema.clone());
        let reflector = SchemaReflector::new(pool.clone());
        Self {
            pool,
            config,
            state,
            reflector,
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Initialize the state schema. Idempotent; fails if a newer engine
    /// owns the state schema.
    pub async fn init(&self) -> MigrateResult<()> {
        self.state.init().await
    }

    /// Dry-run preflight: reflect the schema and validate every
    /// operation against it, collecting all errors.
    pub async fn validate(&self, migration: &Migration) -> MigrateResult<()> {
        let schema = self.reflector.reflect(&self.config.schema).await?;
        validate_operations(migration, &schema)
    }

    /// Start a migration: expand the schema, install dual-write
    /// triggers, backfill pre-existing rows, and materialize the new
    /// version's views alongside the old version's.
    pub async fn start(
        &self,
        migration: &Migration,
        progress: Option<&Progress>,
        cancel: &CancellationToken,
    ) -> MigrateResult<()> {
        if !self.state.is_initialized().await? {
            return Err(MigrationError::NotInitialized);
        }
        if migration.name.trim().is_empty() {
            return Err(MigrationError::validation("migration name must not be empty"));
        }
        if let Some(active) = self.state.active_migration(&self.config.schema).await? {
            return Err(MigrationError::ActiveMigrationExists {
                schema: self.config.schema.clone(),
                name: active.name,
            });
        }
        if self
            .state
            .migration_exists(&self.config.schema, &migration.name)
            .await?
        {
            return Err(MigrationError::MigrationExists(migration.name.clone()));
        }

        let head = self.state.latest_version(&self.config.schema).await?;
        if let Some(declared) = &migration.parent
            && head.as_deref() != Some(declared.as_str())
        {
            return Err(MigrationError::ParentMismatch {
                declared: migration.parent.clone(),
                head,
            });
        }

        let old_schema = self.reflector.reflect(&self.config.schema).await?;
        validate_operations(migration, &old_schema)?;

        self.state
            .start_migration(&self.config.schema, migration, head.as_deref())
            .await?;
        info!(schema = %self.config.schema, migration = %migration.name, "Migration started");

        match self
            .expand(migration, &old_schema, head.as_deref(), progress, cancel)
            .await
        {
            Ok(()) => {
                info!(migration = %migration.name, "Both schema versions are live");
                Ok(())
            }
            Err(e) => {
                warn!(migration = %migration.name, error = %e, "Start failed, unwinding");
                let unwind_errors = self
                    .unwind_expansion(migration, &old_schema, head.as_deref())
                    .await;
                for err in &unwind_errors {
                    warn!(migration = %migration.name, error = %err, "Unwind step failed");
                }
                self.state
                    .rollback_migration(&self.config.schema, &migration.name)
                    .await?;
                Err(e)
            }
        }
    }

    /// Complete the in-progress migration: contract to the new shape,
    /// validate constraints, drop the old version, all in one
    /// transaction.
    pub async fn complete(&self, cancel: &CancellationToken) -> MigrateResult<()> {
        let record = self
            .state
            .active_migration(&self.config.schema)
            .await?
            .ok_or_else(|| MigrationError::NoActiveMigration(self.config.schema.clone()))?;
        let migration = record.migration.clone();

        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }

        let old_schema = self.previous_schema().await?;
        let mut final_schema = old_schema.clone();
        for op in &migration.operations {
            op.as_operation()
                .update_schema(&mut final_schema)
                .map_err(|e| {
                    MigrationError::invariant(format!(
                        "history does not apply to the previous schema: {}",
                        e
                    ))
                })?;
        }

        let strategies = backfill_strategies(&migration, &old_schema);
        let new_version = version_schema_name(&self.config.schema, &migration.name);
        let old_version = record
            .parent
            .as_ref()
            .map(|p| version_schema_name(&self.config.schema, p));
        let ctx = OperationContext {
            schema_name: &self.config.schema,
            state_schema: self.state.schema(),
            new_version_schema: &new_version,
            old_version_schema: old_version.as_deref(),
            schema: &old_schema,
        };
        let invoker = self.security_invoker().await?;

        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        self.apply_guards(&tx).await?;
        let exec = Executor::Transaction(&tx);

        if let Some(old_version) = &old_version {
            views::drop_version_schema(&exec, old_version).await?;
        }
        for stmt in teardown_sql(&self.config.schema, &migration, &ctx, &strategies) {
            tx.batch_execute(&stmt).await?;
        }
        for op in &migration.operations {
            let operation = op.as_operation();
            operation
                .complete(&exec, &ctx)
                .await
                .map_err(|e| MigrationError::phase(operation.name(), "complete", e))?;
        }

        let plan = ViewPlan::identity(&final_schema);
        views::create_version_views(&tx, &self.config.schema, &new_version, &plan, invoker).await?;
        self.state
            .complete_migration(&tx, &self.config.schema, &record.name, &final_schema)
            .await?;
        tx.commit().await?;

        // The logically computed snapshot cannot see through raw SQL;
        // refresh it from the live catalog.
        if let Ok(reflected) = self.reflector.reflect(&self.config.schema).await {
            let _ = self
                .state
                .update_resulting_schema(&self.config.schema, &record.name, &reflected)
                .await;
        }

        info!(migration = %record.name, "Migration complete");
        Ok(())
    }

    /// Roll back the in-progress migration: drop the new version and
    /// every expansion artifact, best-effort, and record the terminal
    /// state.
    pub async fn rollback(&self, cancel: &CancellationToken) -> MigrateResult<()> {
        let record = self
            .state
            .active_migration(&self.config.schema)
            .await?
            .ok_or_else(|| MigrationError::NoActiveMigration(self.config.schema.clone()))?;
        let migration = record.migration.clone();

        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }

        let old_schema = self.previous_schema().await?;
        let errors = self
            .unwind_expansion(&migration, &old_schema, record.parent.as_deref())
            .await;

        self.state
            .rollback_migration(&self.config.schema, &record.name)
            .await?;

        if errors.is_empty() {
            info!(migration = %record.name, "Migration rolled back");
            Ok(())
        } else {
            Err(MigrationError::RollbackIncomplete { errors })
        }
    }

    /// Record a pre-existing schema as the origin point of history.
    ///
    /// Writes a completed history row with no operations whose snapshot
    /// is the freshly reflected schema, and materializes its version
    /// views so clients can target it.
    pub async fn baseline(&self, name: &str) -> MigrateResult<()> {
        if !self.state.is_initialized().await? {
            return Err(MigrationError::NotInitialized);
        }
        if let Some(active) = self.state.active_migration(&self.config.schema).await? {
            return Err(MigrationError::ActiveMigrationExists {
                schema: self.config.schema.clone(),
                name: active.name,
            });
        }
        if self.state.migration_exists(&self.config.schema, name).await? {
            return Err(MigrationError::MigrationExists(name.to_string()));
        }

        let head = self.state.latest_version(&self.config.schema).await?;
        let reflected = self.reflector.reflect(&self.config.schema).await?;
        self.state
            .baseline(&self.config.schema, name, head.as_deref(), &reflected)
            .await?;

        let invoker = self.security_invoker().await?;
        let plan = ViewPlan::identity(&reflected);
        let version = version_schema_name(&self.config.schema, name);
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        self.apply_guards(&tx).await?;
        views::create_version_views(&tx, &self.config.schema, &version, &plan, invoker).await?;
        tx.commit().await?;
        Ok(())
    }

    /// The most recent completed migration name, if any.
    pub async fn latest_version(&self) -> MigrateResult<Option<String>> {
        self.state.latest_version(&self.config.schema).await
    }

    /// The full migration history, oldest first.
    pub async fn history(&self) -> MigrateResult<Vec<MigrationRecord>> {
        self.state.history(&self.config.schema).await
    }

    /// Current status: head version, in-progress migration, history.
    pub async fn status(&self) -> MigrateResult<MigrationStatus> {
        let latest_version = self.state.latest_version(&self.config.schema).await?;
        let active = self
            .state
            .active_migration(&self.config.schema)
            .await?
            .map(|r| r.name);
        let history = self.state.history(&self.config.schema).await?;
        Ok(MigrationStatus {
            schema: self.config.schema.clone(),
            latest_version,
            active,
            history,
        })
    }

    /// Run the expansion side of `start`.
    async fn expand(
        &self,
        migration: &Migration,
        old_schema: &Schema,
        head: Option<&str>,
        progress: Option<&Progress>,
        cancel: &CancellationToken,
    ) -> MigrateResult<()> {
        let new_version = version_schema_name(&self.config.schema, &migration.name);
        let old_version = head.map(|h| version_schema_name(&self.config.schema, h));
        let ctx = OperationContext {
            schema_name: &self.config.schema,
            state_schema: self.state.schema(),
            new_version_schema: &new_version,
            old_version_schema: old_version.as_deref(),
            schema: old_schema,
        };
        let strategies = backfill_strategies(migration, old_schema);

        // Per-operation start, one transaction each.
        for op in &migration.operations {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }
            let operation = op.as_operation();
            debug!(operation = operation.name(), "Running start phase");
            let result = if operation.transactional() {
                self.start_in_transaction(operation, &ctx).await
            } else {
                self.start_on_direct_connection(operation, &ctx).await
            };
            result.map_err(|e| MigrationError::phase(operation.name(), "start", e))?;
        }

        // Dual-write triggers and backfill flag columns, one transaction.
        self.install_triggers(migration, &ctx, &strategies).await?;

        // Online backfill, outside any long transaction.
        let backfiller = Backfill::new(
            &self.pool,
            &self.config.backfill,
            &self.config.schema,
            self.state.schema(),
        );
        for (table_name, strategy) in &strategies {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }
            let table = old_schema.require_table(table_name)?;
            backfiller.run(table, strategy, progress, cancel).await?;
        }

        // Both version schemas, regenerated wholesale in one transaction.
        let invoker = self.security_invoker().await?;
        let old_plan = ViewPlan::identity(old_schema);
        let mut new_plan = old_plan.clone();
        for op in &migration.operations {
            op.as_operation().project(&mut new_plan)?;
        }

        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        self.apply_guards(&tx).await?;
        if let Some(old_version) = &old_version {
            views::create_version_views(&tx, &self.config.schema, old_version, &old_plan, invoker)
                .await?;
        }
        views::create_version_views(&tx, &self.config.schema, &new_version, &new_plan, invoker)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Tear down everything `start` built, in reverse: the new version's
    /// views, the triggers and flag columns, then each operation's
    /// expansion. Best-effort; returns the failures.
    async fn unwind_expansion(
        &self,
        migration: &Migration,
        old_schema: &Schema,
        head: Option<&str>,
    ) -> Vec<String> {
        let new_version = version_schema_name(&self.config.schema, &migration.name);
        let old_version = head.map(|h| version_schema_name(&self.config.schema, h));
        let ctx = OperationContext {
            schema_name: &self.config.schema,
            state_schema: self.state.schema(),
            new_version_schema: &new_version,
            old_version_schema: old_version.as_deref(),
            schema: old_schema,
        };
        let strategies = backfill_strategies(migration, old_schema);
        let mut errors = Vec::new();

        match self.pool.get().await {
            Ok(conn) => {
                let exec = Executor::Connection(&conn);
                if let Err(e) = views::drop_version_schema(&exec, &new_version).await {
                    errors.push(format!("dropping version schema: {}", e));
                }
                for stmt in teardown_sql(&self.config.schema, migration, &ctx, &strategies) {
                    if let Err(e) = conn.batch_execute(&stmt).await {
                        errors.push(format!("trigger teardown: {}", e));
                    }
                }
            }
            Err(e) => errors.push(format!("acquiring connection: {}", e)),
        }

        for op in migration.operations.iter().rev() {
            let operation = op.as_operation();
            debug!(operation = operation.name(), "Running rollback phase");
            let result = if operation.transactional() {
                self.rollback_in_transaction(operation, &ctx).await
            } else {
                self.rollback_on_direct_connection(operation, &ctx).await
            };
            if let Err(e) = result {
                errors.push(format!("{}: {}", operation.name(), e));
            }
        }
        errors
    }

    async fn start_in_transaction(
        &self,
        operation: &dyn Operation,
        ctx: &OperationContext<'_>,
    ) -> MigrateResult<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        self.apply_guards(&tx).await?;
        operation.start(&Executor::Transaction(&tx), ctx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn start_on_direct_connection(
        &self,
        operation: &dyn Operation,
        ctx: &OperationContext<'_>,
    ) -> MigrateResult<()> {
        let conn = self.direct_connection().await?;
        operation.start(&Executor::Direct(&conn), ctx).await
    }

    async fn rollback_in_transaction(
        &self,
        operation: &dyn Operation,
        ctx: &OperationContext<'_>,
    ) -> MigrateResult<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        self.apply_guards(&tx).await?;
        operation.rollback(&Executor::Transaction(&tx), ctx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback_on_direct_connection(
        &self,
        operation: &dyn Operation,
        ctx: &OperationContext<'_>,
    ) -> MigrateResult<()> {
        let conn = self.direct_connection().await?;
        operation.rollback(&Executor::Direct(&conn), ctx).await
    }

    /// Install the migration's dual-write triggers and backfill flag
    /// columns in one transaction.
    async fn install_triggers(
        &self,
        migration: &Migration,
        ctx: &OperationContext<'_>,
        strategies: &IndexMap<String, BackfillStrategy>,
    ) -> MigrateResult<()> {
        let specs: Vec<_> = migration
            .operations
            .iter()
            .flat_map(|op| op.as_operation().dual_writes(ctx))
            .collect();
        let flag_tables: Vec<&String> = strategies
            .iter()
            .filter(|(_, s)| s.uses_flag_column())
            .map(|(t, _)| t)
            .collect();
        if specs.is_empty() && flag_tables.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        self.apply_guards(&tx).await?;

        for table in &flag_tables {
            tx.batch_execute(&trigger::ensure_backfill_flag_sql(&self.config.schema, table))
                .await?;
        }

        for ((table, _column), group) in trigger::group_dual_writes(specs) {
            let clear_flag = strategies
                .get(&table)
                .map(|s| s.uses_flag_column())
                .unwrap_or(false);
            tx.batch_execute(&trigger::build_trigger_sql(
                &self.config.schema,
                ctx.new_version_schema,
                &group,
                clear_flag,
            ))
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// `SET LOCAL lock_timeout` and role for one phase transaction.
    async fn apply_guards(&self, tx: &PgTransaction<'_>) -> MigrateResult<()> {
        tx.batch_execute(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.config.lock_timeout.as_millis()
        ))
        .await?;
        if let Some(role) = &self.config.role {
            tx.batch_execute(&format!("SET LOCAL ROLE {}", quote_ident(role)))
                .await?;
        }
        Ok(())
    }

    /// A standalone connection with session-level guards, for statements
    /// that cannot run inside a transaction block.
    async fn direct_connection(&self) -> MigrateResult<DirectConnection> {
        let conn = self.pool.dedicated().await?;
        conn.batch_execute(&format!(
            "SET lock_timeout = '{}ms'",
            self.config.lock_timeout.as_millis()
        ))
        .await?;
        if let Some(role) = &self.config.role {
            conn.batch_execute(&format!("SET ROLE {}", quote_ident(role)))
                .await?;
        }
        Ok(conn)
    }

    /// The logical schema before the in-progress migration: the head's
    /// persisted snapshot, or an empty schema when history is empty.
    async fn previous_schema(&self) -> MigrateResult<Schema> {
        Ok(self
            .state
            .latest_schema(&self.config.schema)
            .await?
            .unwrap_or_else(|| Schema::new(&self.config.schema)))
    }

    async fn security_invoker(&self) -> MigrateResult<bool> {
        Ok(self.reflector.server_version_num().await? >= SECURITY_INVOKER_MIN_VERSION)
    }
}

/// Validate each operation against the virtually evolved schema,
/// collecting every error.
fn validate_operations(migration: &Migration, schema: &Schema) -> MigrateResult<()> {
    let mut virtual_schema = schema.clone();
    let mut errors = Vec::new();
    for (index, op) in migration.operations.iter().enumerate() {
        let operation = op.as_operation();
        if let Err(e) = operation.validate(&virtual_schema) {
            errors.push(format!(
                "operation {} ({}): {}",
                index + 1,
                operation.name(),
                e
            ));
            continue;
        }
        if let Err(e) = operation.update_schema(&mut virtual_schema) {
            errors.push(format!(
                "operation {} ({}): {}",
                index + 1,
                operation.name(),
                e
            ));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(MigrationError::Validation { errors })
    }
}

/// Backfill strategy per table, in first-use order. Tables created by
/// the migration itself have no pre-existing rows and are skipped.
fn backfill_strategies(
    migration: &Migration,
    old_schema: &Schema,
) -> IndexMap<String, BackfillStrategy> {
    let mut strategies = IndexMap::new();
    for op in &migration.operations {
        if let Some(table_name) = op.as_operation().backfill_table()
            && !strategies.contains_key(table_name)
            && let Some(table) = old_schema.table(table_name)
        {
            strategies.insert(table_name.to_string(), BackfillStrategy::for_table(table));
        }
    }
    strategies
}

/// Teardown DDL for every trigger and flag column the migration
/// installed.
fn teardown_sql(
    schema: &str,
    migration: &Migration,
    ctx: &OperationContext<'_>,
    strategies: &IndexMap<String, BackfillStrategy>,
) -> Vec<String> {
    let specs: Vec<_> = migration
        .operations
        .iter()
        .flat_map(|op| op.as_operation().dual_writes(ctx))
        .collect();
    let mut statements: Vec<String> = trigger::group_dual_writes(specs)
        .keys()
        .map(|(table, column)| trigger::drop_trigger_sql(schema, table, column))
        .collect();
    for (table, strategy) in strategies {
        if strategy.uses_flag_column() {
            statements.push(trigger::drop_backfill_flag_sql(schema, table));
        }
    }
    statements
}

#[cfg(test)]
mod tests {
    use pgroll_schema::{Column, Table};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::operations::{AddColumn, AlterColumn, ColumnDef, Op};

    fn schema() -> Schema {
        let mut users = Table::new("users");
        users
            .add_column(Column::new("id", "integer").not_null())
            .unwrap();
        users
            .add_column(Column::new("name", "character varying(255)"))
            .unwrap();
        users.primary_key = vec!["id".to_string()];

        let mut log = Table::new("log");
        log.add_column(Column::new("line", "text")).unwrap();

        let mut schema = Schema::new("public");
        schema.add_table(users).unwrap();
        schema.add_table(log).unwrap();
        schema
    }

    fn set_not_null() -> Op {
        Op::AlterColumn(AlterColumn {
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
        })
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.schema, "public");
        assert_eq!(config.state_schema, "pgroll");
        assert_eq!(config.lock_timeout, Duration::from_millis(500));
        assert!(config.role.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .schema("app")
            .state_schema("migrations")
            .lock_timeout(Duration::from_secs(1))
            .role("migrator");

        assert_eq!(config.schema, "app");
        assert_eq!(config.state_schema, "migrations");
        assert_eq!(config.role.as_deref(), Some("migrator"));
    }

    #[test]
    fn test_validate_operations_collects_all_errors() {
        let migration = Migration::new(
            "02_bad",
            vec![
                Op::AddColumn(AddColumn {
                    table: "missing".to_string(),
                    column: ColumnDef::new("x", "text"),
                    up: None,
                }),
                Op::AddColumn(AddColumn {
                    table: "users".to_string(),
                    column: ColumnDef::new("id", "text"),
                    up: None,
                }),
            ],
        );

        let err = validate_operations(&migration, &schema()).unwrap_err();
        match err {
            MigrationError::Validation { errors } => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("operation 1"));
                assert!(errors[1].contains("operation 2"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_validate_operations_sees_earlier_effects() {
        // The second operation alters a column the first one adds; the
        // virtual schema makes that valid.
        let migration = Migration::new(
            "02_add_then_alter",
            vec![
                Op::AddColumn(AddColumn {
                    table: "users".to_string(),
                    column: ColumnDef::new("status", "text"),
                    up: None,
                }),
                Op::AlterColumn(AlterColumn {
                    table: "users".to_string(),
                    column: "status".to_string(),
                    name: Some("state".to_string()),
                    data_type: None,
                    nullable: None,
                    default: None,
                    unique: false,
                    check: None,
                    up: None,
                    down: None,
                }),
            ],
        );

        assert!(validate_operations(&migration, &schema()).is_ok());
    }

    #[test]
    fn test_backfill_strategies_dedupe_and_skip_new_tables() {
        let migration = Migration::new(
            "02_mixed",
            vec![
                set_not_null(),
                set_not_null(),
                Op::AddColumn(AddColumn {
                    table: "brand_new".to_string(),
                    column: ColumnDef::new("x", "text"),
                    up: Some("'x'".to_string()),
                }),
            ],
        );

        let strategies = backfill_strategies(&migration, &schema());
        assert_eq!(strategies.len(), 1);
        assert!(matches!(
            strategies["users"],
            BackfillStrategy::Identity(_)
        ));
    }

    #[test]
    fn test_teardown_sql_covers_triggers_and_flags() {
        let migration = Migration::new(
            "02_flagged",
            vec![
                set_not_null(),
                Op::AddColumn(AddColumn {
                    table: "log".to_string(),
                    column: ColumnDef::new("level", "text"),
                    up: Some("'info'".to_string()),
                }),
            ],
        );
        let schema = schema();
        let ctx = OperationContext {
            schema_name: "public",
            state_schema: "pgroll",
            new_version_schema: "public_02_flagged",
            old_version_schema: Some("public_01_init"),
            schema: &schema,
        };
        let strategies = backfill_strategies(&migration, &schema);

        let statements = teardown_sql("public", &migration, &ctx, &strategies);
        let joined = statements.join("\n");
        assert!(joined.contains("_pgroll_trigger_users_name"));
        assert!(joined.contains("_pgroll_trigger_log_level"));
        // The log table has no identity columns, so its flag column is
        // dropped too.
        assert!(joined.contains("DROP COLUMN IF EXISTS \"_pgroll_needs_backfill\""));
    }
}
