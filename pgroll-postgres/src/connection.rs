//! PostgreSQL connection and transaction wrappers.

use std::sync::Arc;

use deadpool_postgres::Object;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::debug;

use crate::config::PgConfig;
use crate::error::PgResult;
use crate::statement::PreparedStatementCache;

/// A wrapper around a pooled PostgreSQL connection with statement caching.
pub struct PgConnection {
    client: Object,
    statement_cache: Arc<PreparedStatementCache>,
}

impl PgConnection {
    /// Create a new connection wrapper.
    pub(crate) fn new(client: Object, statement_cache: Arc<PreparedStatementCache>) -> Self {
        Self {
            client,
            statement_cache,
        }
    }

    /// Execute a query and return all rows.
    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<Vec<Row>> {
        debug!(sql = %sql, "Executing query");
        let stmt = self.statement_cache.get_or_prepare(&self.client, sql).await?;
        let rows = self.client.query(&stmt, params).await?;
        Ok(rows)
    }

    /// Execute a query and return exactly one row.
    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<Row> {
        debug!(sql = %sql, "Executing query_one");
        let stmt = self.statement_cache.get_or_prepare(&self.client, sql).await?;
        let row = self.client.query_one(&stmt, params).await?;
        Ok(row)
    }

    /// Execute a query and return zero or one row.
    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> PgResult<Option<Row>> {
        debug!(sql = %sql, "Executing query_opt");
        let stmt = self.statement_cache.get_or_prepare(&self.client, sql).await?;
        let row = self.client.query_opt(&stmt, params).await?;
        Ok(row)
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<u64> {
        debug!(sql = %sql, "Executing statement");
        let stmt = self.statement_cache.get_or_prepare(&self.client, sql).await?;
        let count = self.client.execute(&stmt, params).await?;
        Ok(count)
    }

    /// Execute a batch of statements in a single round-trip.
    pub async fn batch_execute(&self, sql: &str) -> PgResult<()> {
        debug!(sql = %sql, "Executing batch");
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    /// Begin a transaction.
    pub async fn transaction(&mut self) -> PgResult<PgTransaction<'_>> {
        debug!("Beginning transaction");
        let txn = self.client.transaction().await?;
        Ok(PgTransaction {
            txn,
            statement_cache: self.statement_cache.clone(),
        })
    }

    /// Get the underlying pooled client for operations not covered here.
    pub fn inner(&self) -> &Object {
        &self.client
    }
}

/// A PostgreSQL transaction.
pub struct PgTransaction<'a> {
    txn: deadpool_postgres::Transaction<'a>,
    statement_cache: Arc<PreparedStatementCache>,
}

impl PgTransaction<'_> {
    /// Execute a query and return all rows.
    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<Vec<Row>> {
        debug!(sql = %sql, "Executing query in transaction");
        let stmt = self
            .statement_cache
            .get_or_prepare_in_txn(&self.txn, sql)
            .await?;
        let rows = self.txn.query(&stmt, params).await?;
        Ok(rows)
    }

    /// Execute a query and return exactly one row.
    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<Row> {
        let stmt = self
            .statement_cache
            .get_or_prepare_in_txn(&self.txn, sql)
            .await?;
        let row = self.txn.query_one(&stmt, params).await?;
        Ok(row)
    }

    /// Execute a query and return zero or one row.
    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> PgResult<Option<Row>> {
        let stmt = self
            .statement_cache
            .get_or_prepare_in_txn(&self.txn, sql)
            .await?;
        let row = self.txn.query_opt(&stmt, params).await?;
        Ok(row)
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<u64> {
        let stmt = self
            .statement_cache
            .get_or_prepare_in_txn(&self.txn, sql)
            .await?;
        let count = self.txn.execute(&stmt, params).await?;
        Ok(count)
    }

    /// Execute a batch of statements in a single round-trip.
    pub async fn batch_execute(&self, sql: &str) -> PgResult<()> {
        debug!(sql = %sql, "Executing batch in transaction");
        self.txn.batch_execute(sql).await?;
        Ok(())
    }

    /// Commit the transaction.
    pub async fn commit(self) -> PgResult<()> {
        debug!("Committing transaction");
        self.txn.commit().await?;
        Ok(())
    }

    /// Rollback the transaction.
    pub async fn rollback(self) -> PgResult<()> {
        debug!("Rolling back transaction");
        self.txn.rollback().await?;
        Ok(())
    }
}

/// A standalone connection opened outside the pool.
///
/// The pool recycles idle connections; a session that must stay pinned for
/// a long time (a snapshot-exporting transaction, a `CONCURRENTLY` index
/// build) uses one of these instead.
pub struct DirectConnection {
    client: tokio_postgres::Client,
    driver: tokio::task::JoinHandle<()>,
}

impl DirectConnection {
    /// Open a new standalone connection.
    pub async fn connect(config: &PgConfig) -> PgResult<Self> {
        let (client, connection) = config.to_pg_config().connect(NoTls).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Standalone connection terminated");
            }
        });
        Ok(Self { client, driver })
    }

    /// Execute a query and return all rows.
    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<Vec<Row>> {
        debug!(sql = %sql, "Executing query on standalone connection");
        let rows = self.client.query(sql, params).await?;
        Ok(rows)
    }

    /// Execute a query and return exactly one row.
    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<Row> {
        let row = self.client.query_one(sql, params).await?;
        Ok(row)
    }

    /// Execute a query and return zero or one row.
    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> PgResult<Option<Row>> {
        let row = self.client.query_opt(sql, params).await?;
        Ok(row)
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<u64> {
        debug!(sql = %sql, "Executing statement on standalone connection");
        let count = self.client.execute(sql, params).await?;
        Ok(count)
    }

    /// Execute a batch of statements in a single round-trip.
    pub async fn batch_execute(&self, sql: &str) -> PgResult<()> {
        debug!(sql = %sql, "Executing batch on standalone connection");
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    /// Whether the connection has been closed by the server.
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

impl Drop for DirectConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// A uniform execution surface over a transaction or an autocommit
/// connection.
///
/// Most DDL runs inside a phase transaction; statements that PostgreSQL
/// forbids inside a transaction block (`CREATE INDEX CONCURRENTLY`) run on
/// a plain connection. Callers that must work in both settings take one of
/// these.
pub enum Executor<'a> {
    /// A pooled connection in autocommit mode.
    Connection(&'a PgConnection),
    /// An open transaction.
    Transaction(&'a PgTransaction<'a>),
    /// A standalone connection in autocommit mode.
    Direct(&'a DirectConnection),
}

impl Executor<'_> {
    /// Execute a query and return all rows.
    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<Vec<Row>> {
        match self {
            Self::Connection(conn) => conn.query(sql, params).await,
            Self::Transaction(txn) => txn.query(sql, params).await,
            Self::Direct(conn) => conn.query(sql, params).await,
        }
    }

    /// Execute a query and return exactly one row.
    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<Row> {
        match self {
            Self::Connection(conn) => conn.query_one(sql, params).await,
            Self::Transaction(txn) => txn.query_one(sql, params).await,
            Self::Direct(conn) => conn.query_one(sql, params).await,
        }
    }

    /// Execute a query and return zero or one row.
    pub async fn query_opt(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<Option<Row>> {
        match self {
            Self::Connection(conn) => conn.query_opt(sql, params).await,
            Self::Transaction(txn) => txn.query_opt(sql, params).await,
            Self::Direct(conn) => conn.query_opt(sql, params).await,
        }
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<u64> {
        match self {
            Self::Connection(conn) => conn.execute(sql, params).await,
            Self::Transaction(txn) => txn.execute(sql, params).await,
            Self::Direct(conn) => conn.execute(sql, params).await,
        }
    }

    /// Execute a batch of statements in a single round-trip.
    pub async fn batch_execute(&self, sql: &str) -> PgResult<()> {
        match self {
            Self::Connection(conn) => conn.batch_execute(sql).await,
            Self::Transaction(txn) => txn.batch_execute(sql).await,
            Self::Direct(conn) => conn.batch_execute(sql).await,
        }
    }

    /// Whether statements execute inside an open transaction.
    pub fn in_transaction(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }
}
