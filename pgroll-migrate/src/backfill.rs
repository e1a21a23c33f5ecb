//! The online backfill engine.
//!
//! After `start` installs shadow columns and dual-write triggers, rows that
//! existed before the migration still have empty shadow columns. The
//! backfill visits those rows in bounded batches and issues no-op
//! self-assignment updates; the updates fire the dual-write trigger, which
//! fills the shadow values. No long transaction is held over the table and
//! no table-level lock outlives a batch.
//!
//! Tables with identity columns use a snapshot-pinned scan (a dedicated
//! coordinating connection keeps a `REPEATABLE READ` snapshot exported for
//! the whole run, so rows inserted after `start` are never revisited).
//! Tables without identity columns fall back to the needs-backfill flag
//! column, which the trigger clears row by row.

use std::time::Duration;

use pgroll_postgres::{PgPool, RetryPolicy};
use pgroll_schema::{Table, reserved};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{MigrateResult, MigrationError};
use crate::sql::{quote_ident, quote_literal, quote_qualified};

/// Progress callback: `(rows done, rows total)`.
pub type Progress = dyn Fn(u64, u64) + Send + Sync;

/// One identity column used to key batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityColumn {
    /// Column name.
    pub name: String,
    /// SQL type, used to cast watermark literals back from text.
    pub data_type: String,
}

/// How a table's pre-existing rows are visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillStrategy {
    /// Batches keyed on identity columns under an exported snapshot.
    Identity(Vec<IdentityColumn>),
    /// ctid-limited batches driven by the needs-backfill flag column.
    FlagColumn,
}

impl BackfillStrategy {
    /// Choose the strategy for a table: primary key, else a single
    /// unique-not-null column, else the flag column.
    pub fn for_table(table: &Table) -> Self {
        let identity: Vec<IdentityColumn> = table
            .identity_columns()
            .into_iter()
            .map(|c| IdentityColumn {
                name: c.name.clone(),
                data_type: c.data_type.clone(),
            })
            .collect();
        if identity.is_empty() {
            Self::FlagColumn
        } else {
            Self::Identity(identity)
        }
    }

    /// Whether the strategy relies on the needs-backfill flag column.
    pub fn uses_flag_column(&self) -> bool {
        matches!(self, Self::FlagColumn)
    }
}

/// Configuration for the backfill engine.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Rows per batch.
    pub batch_size: u64,
    /// Pause between batches.
    pub batch_delay: Duration,
    /// Retry policy for the short batch transactions.
    pub retry: RetryPolicy,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            batch_delay: Duration::ZERO,
            retry: RetryPolicy::default(),
        }
    }
}

/// Drives the backfill of one table at a time.
pub struct Backfill<'a> {
    pool: &'a PgPool,
    config: &'a BackfillConfig,
    schema: &'a str,
    state_schema: &'a str,
}

impl<'a> Backfill<'a> {
    /// Create a backfill driver.
    pub fn new(
        pool: &'a PgPool,
        config: &'a BackfillConfig,
        schema: &'a str,
        state_schema: &'a str,
    ) -> Self {
        Self {
            pool,
            config,
            schema,
            state_schema,
        }
    }

    /// Backfill one table with the given strategy.
    pub async fn run(
        &self,
        table: &Table,
        strategy: &BackfillStrategy,
        progress: Option<&Progress>,
        cancel: &CancellationToken,
    ) -> MigrateResult<()> {
        let result = match strategy {
            BackfillStrategy::Identity(columns) => {
                self.run_snapshot(table, columns, progress, cancel).await
            }
            BackfillStrategy::FlagColumn => self.run_flagged(table, progress, cancel).await,
        };
        result.map_err(|e| MigrationError::backfill(&table.name, e))
    }

    /// Snapshot-pinned batched backfill over identity columns.
    async fn run_snapshot(
        &self,
        table: &Table,
        columns: &[IdentityColumn],
        progress: Option<&Progress>,
        cancel: &CancellationToken,
    ) -> MigrateResult<()> {
        let table_q = quote_qualified(self.schema, &table.name);
        let helper = format!("batch_{}", table.name);
        let helper_q = quote_qualified(self.state_schema, &helper);
        let total = self.estimate_rows(&table.name).await?;

        // The coordinator pins the snapshot for the whole run; it is a
        // standalone connection so the pool cannot recycle it mid-backfill.
        let coordinator = self.pool.dedicated().await?;
        coordinator
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ")
            .await
            .map_err(MigrationError::from)?;
        let snapshot: String = coordinator
            .query_one("SELECT pg_export_snapshot() AS snapshot", &[])
            .await
            .map_err(MigrationError::from)?
            .get("snapshot");

        info!(
            table = %table.name,
            total = total,
            snapshot = %snapshot,
            "Backfill started"
        );

        let setup = self.pool.get().await?;
        setup
            .batch_execute(&create_helper_sql(&helper_q, &table_q, columns))
            .await?;
        drop(setup);

        let result = self
            .batch_loop(table, columns, &table_q, &helper_q, &snapshot, total, progress, cancel)
            .await;

        // Teardown happens on success and failure alike; the coordinator
        // transaction only ever read.
        let cleanup = self.pool.get().await;
        if let Ok(conn) = cleanup {
            let _ = conn
                .batch_execute(&format!("DROP TABLE IF EXISTS {}", helper_q))
                .await;
        }
        let _ = coordinator.batch_execute("ROLLBACK").await;

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn batch_loop(
        &self,
        table: &Table,
        columns: &[IdentityColumn],
        table_q: &str,
        helper_q: &str,
        snapshot: &str,
        total: u64,
        progress: Option<&Progress>,
        cancel: &CancellationToken,
    ) -> MigrateResult<()> {
        let update_sql = update_batch_sql(helper_q, table_q, &table.name, columns);
        let mut watermark: Option<Vec<String>> = None;
        let mut done: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            // Step one: pin the exported snapshot and stage the next batch
            // of identity tuples into the helper table.
            let insert_sql = insert_batch_sql(
                helper_q,
                table_q,
                columns,
                watermark.as_deref(),
                self.config.batch_size,
            );
            let inserted = self
                .config
                .retry
                .run(async || {
                    let conn = self.pool.get().await?;
                    conn.batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ")
                        .await?;
                    let staged = async {
                        conn.batch_execute(&format!(
                            "SET TRANSACTION SNAPSHOT {}",
                            quote_literal(snapshot)
                        ))
                        .await?;
                        conn.batch_execute(&format!("TRUNCATE {}", helper_q)).await?;
                        let n = conn.execute(&insert_sql, &[]).await?;
                        conn.batch_execute("COMMIT").await?;
                        Ok(n)
                    }
                    .await;
                    if staged.is_err() {
                        let _ = conn.batch_execute("ROLLBACK").await;
                    }
                    staged
                })
                .await?;

            if inserted == 0 {
                break;
            }

            // Step two: no-op self-assignment under the current snapshot,
            // so the update sees the latest row version and fires the
            // dual-write trigger. The last returned tuple becomes the new
            // high-water mark.
            let mark = self
                .config
                .retry
                .run(async || {
                    let conn = self.pool.get().await?;
                    let rows = conn.query(&update_sql, &[]).await?;
                    Ok(rows.last().map(|row| {
                        columns
                            .iter()
                            .map(|c| row.get::<_, String>(c.name.as_str()))
                            .collect::<Vec<_>>()
                    }))
                })
                .await?;

            if let Some(mark) = mark {
                watermark = Some(mark);
            }

            done += inserted;
            debug!(table = %table.name, done = done, total = total, "Backfill batch complete");
            if let Some(cb) = progress {
                cb(done, total.max(done));
            }

            if !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        info!(table = %table.name, rows = done, "Backfill finished");
        Ok(())
    }

    /// Flag-column backfill for tables without identity columns.
    async fn run_flagged(
        &self,
        table: &Table,
        progress: Option<&Progress>,
        cancel: &CancellationToken,
    ) -> MigrateResult<()> {
        let table_q = quote_qualified(self.schema, &table.name);
        let total = self.estimate_rows(&table.name).await?;
        let sql = flag_batch_sql(&table_q, self.config.batch_size);
        let mut done: u64 = 0;

        info!(table = %table.name, total = total, "Backfill started (flag column)");

        loop {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            let touched = self
                .config
                .retry
                .run(async || {
                    let conn = self.pool.get().await?;
                    conn.execute(&sql, &[]).await
                })
                .await?;

            if touched == 0 {
                break;
            }

            done += touched;
            debug!(table = %table.name, done = done, "Backfill batch complete");
            if let Some(cb) = progress {
                cb(done, total.max(done));
            }

            if !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        info!(table = %table.name, rows = done, "Backfill finished");
        Ok(())
    }

    /// Estimated row count: planner statistics first, exact count as the
    /// fallback when statistics are cold.
    async fn estimate_rows(&self, table: &str) -> MigrateResult<u64> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT n_live_tup FROM pg_stat_user_tables \
                 WHERE schemaname = $1 AND relname = $2",
                &[&self.schema, &table],
            )
            .await?;
        let estimate: i64 = row.map(|r| r.get("n_live_tup")).unwrap_or(0);
        if estimate > 0 {
            return Ok(estimate as u64);
        }

        let row = conn
            .query_one(
                &format!(
                    "SELECT count(*) AS total FROM {}",
                    quote_qualified(self.schema, table)
                ),
                &[],
            )
            .await?;
        let total: i64 = row.get("total");
        Ok(total as u64)
    }
}

/// DDL for the unlogged helper table carrying one batch of identity
/// tuples.
fn create_helper_sql(helper_q: &str, table_q: &str, columns: &[IdentityColumn]) -> String {
    format!(
        "CREATE UNLOGGED TABLE IF NOT EXISTS {} AS SELECT {} FROM {} WHERE false",
        helper_q,
        column_list(columns),
        table_q,
    )
}

/// The staged batch select: identity tuples strictly greater than the
/// watermark, in identity order.
fn insert_batch_sql(
    helper_q: &str,
    table_q: &str,
    columns: &[IdentityColumn],
    watermark: Option<&[String]>,
    batch_size: u64,
) -> String {
    let cols = column_list(columns);
    let predicate = match watermark {
        Some(values) => {
            let literals: Vec<String> = columns
                .iter()
                .zip(values)
                .map(|(c, v)| format!("{}::{}", quote_literal(v), c.data_type))
                .collect();
            format!(" WHERE ({}) > ({})", cols, literals.join(", "))
        }
        None => String::new(),
    };
    format!(
        "INSERT INTO {helper} ({cols}) SELECT {cols} FROM {table}{predicate} ORDER BY {cols} LIMIT {limit}",
        helper = helper_q,
        cols = cols,
        table = table_q,
        predicate = predicate,
        limit = batch_size,
    )
}

/// The no-op self-assignment update joined against the helper table.
///
/// The assignment changes nothing at the SQL level but fires the BEFORE
/// trigger on every matched row; `LAST_VALUE` over the returned rows
/// carries the high-water mark back to the driver as text.
fn update_batch_sql(
    helper_q: &str,
    table_q: &str,
    table_name: &str,
    columns: &[IdentityColumn],
) -> String {
    let table_ref = quote_ident(table_name);
    let assignments: Vec<String> = columns
        .iter()
        .map(|c| format!("{col} = {table}.{col}", col = quote_ident(&c.name), table = table_ref))
        .collect();
    let join: Vec<String> = columns
        .iter()
        .map(|c| {
            format!(
                "{table}.{col} = \"batch\".{col}",
                table = table_ref,
                col = quote_ident(&c.name)
            )
        })
        .collect();
    let returning: Vec<String> = columns
        .iter()
        .map(|c| format!("{}.{}", table_ref, quote_ident(&c.name)))
        .collect();
    let last_values: Vec<String> = columns
        .iter()
        .map(|c| {
            format!(
                "LAST_VALUE({col}::text) OVER () AS {col}",
                col = quote_ident(&c.name)
            )
        })
        .collect();

    format!(
        "WITH \"batch\" AS (SELECT {cols} FROM {helper}), \
         \"updated\" AS (UPDATE {table} SET {assignments} FROM \"batch\" WHERE {join} RETURNING {returning}) \
         SELECT {last_values} FROM \"updated\"",
        cols = column_list(columns),
        helper = helper_q,
        table = table_q,
        assignments = assignments.join(", "),
        join = join.join(" AND "),
        returning = returning.join(", "),
        last_values = last_values.join(", "),
    )
}

/// The flag-column batch update: touching a row fires the trigger, which
/// clears the flag; termination is "no rows affected".
fn flag_batch_sql(table_q: &str, batch_size: u64) -> String {
    let flag = quote_ident(reserved::NEEDS_BACKFILL_COLUMN);
    format!(
        "UPDATE {table} SET {flag} = true WHERE ctid IN \
         (SELECT ctid FROM {table} WHERE {flag} LIMIT {limit})",
        table = table_q,
        flag = flag,
        limit = batch_size,
    )
}

fn column_list(columns: &[IdentityColumn]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use pgroll_schema::{Column, UniqueConstraint};
    use pretty_assertions::assert_eq;

    use super::*;

    fn id_column() -> IdentityColumn {
        IdentityColumn {
            name: "id".to_string(),
            data_type: "integer".to_string(),
        }
    }

    fn composite() -> Vec<IdentityColumn> {
        vec![
            IdentityColumn {
                name: "tenant".to_string(),
                data_type: "text".to_string(),
            },
            id_column(),
        ]
    }

    #[test]
    fn test_strategy_prefers_primary_key() {
        let mut table = Table::new("users");
        table
            .add_column(Column::new("id", "integer").not_null())
            .unwrap();
        table.primary_key = vec!["id".to_string()];

        match BackfillStrategy::for_table(&table) {
            BackfillStrategy::Identity(cols) => {
                assert_eq!(cols, vec![id_column()]);
            }
            other => panic!("unexpected strategy: {:?}", other),
        }
    }

    #[test]
    fn test_strategy_unique_not_null_fallback() {
        let mut table = Table::new("events");
        table
            .add_column(Column::new("ref", "text").not_null())
            .unwrap();
        table.unique_constraints.insert(
            "events_ref_key".to_string(),
            UniqueConstraint {
                name: "events_ref_key".to_string(),
                columns: vec!["ref".to_string()],
            },
        );

        assert!(matches!(
            BackfillStrategy::for_table(&table),
            BackfillStrategy::Identity(_)
        ));
    }

    #[test]
    fn test_strategy_flag_column_fallback() {
        let mut table = Table::new("log");
        table.add_column(Column::new("line", "text")).unwrap();
        assert!(BackfillStrategy::for_table(&table).uses_flag_column());
    }

    #[test]
    fn test_create_helper_sql() {
        let sql = create_helper_sql("\"pgroll\".\"batch_users\"", "\"public\".\"users\"", &[id_column()]);
        assert_eq!(
            sql,
            "CREATE UNLOGGED TABLE IF NOT EXISTS \"pgroll\".\"batch_users\" \
             AS SELECT \"id\" FROM \"public\".\"users\" WHERE false"
        );
    }

    #[test]
    fn test_insert_batch_sql_first_batch_has_no_predicate() {
        let sql = insert_batch_sql(
            "\"pgroll\".\"batch_users\"",
            "\"public\".\"users\"",
            &[id_column()],
            None,
            1000,
        );
        assert_eq!(
            sql,
            "INSERT INTO \"pgroll\".\"batch_users\" (\"id\") \
             SELECT \"id\" FROM \"public\".\"users\" ORDER BY \"id\" LIMIT 1000"
        );
    }

    #[test]
    fn test_insert_batch_sql_watermark_is_lexicographic() {
        let sql = insert_batch_sql(
            "\"pgroll\".\"batch_orders\"",
            "\"public\".\"orders\"",
            &composite(),
            Some(&["acme".to_string(), "42".to_string()]),
            500,
        );
        assert!(sql.contains(
            "WHERE (\"tenant\", \"id\") > ('acme'::text, '42'::integer) \
             ORDER BY \"tenant\", \"id\" LIMIT 500"
        ));
    }

    #[test]
    fn test_insert_batch_sql_quotes_watermark_literals() {
        let sql = insert_batch_sql(
            "\"pgroll\".\"batch_t\"",
            "\"public\".\"t\"",
            &[IdentityColumn {
                name: "name".to_string(),
                data_type: "text".to_string(),
            }],
            Some(&["o'brien".to_string()]),
            10,
        );
        assert!(sql.contains("'o''brien'::text"));
    }

    #[test]
    fn test_update_batch_sql_self_assigns_and_returns_watermark() {
        let sql = update_batch_sql(
            "\"pgroll\".\"batch_users\"",
            "\"public\".\"users\"",
            "users",
            &[id_column()],
        );
        assert!(sql.contains("UPDATE \"public\".\"users\" SET \"id\" = \"users\".\"id\""));
        assert!(sql.contains("FROM \"batch\" WHERE \"users\".\"id\" = \"batch\".\"id\""));
        assert!(sql.contains("RETURNING \"users\".\"id\""));
        assert!(sql.contains("LAST_VALUE(\"id\"::text) OVER () AS \"id\""));
    }

    #[test]
    fn test_flag_batch_sql() {
        let sql = flag_batch_sql("\"public\".\"log\"", 1000);
        assert_eq!(
            sql,
            "UPDATE \"public\".\"log\" SET \"_pgroll_needs_backfill\" = true \
             WHERE ctid IN (SELECT ctid FROM \"public\".\"log\" \
             WHERE \"_pgroll_needs_backfill\" LIMIT 1000)"
        );
    }

    #[test]
    fn test_backfill_config_defaults() {
        let config = BackfillConfig::default();
        assert_eq!(config.batch_size, 1_000);
        assert!(config.batch_delay.is_zero());
    }
}
