//! Connection management.
//!
//! The migration engine uses two kinds of database sessions. Short-lived
//! work (phase transactions, catalog reads, backfill batches) checks a
//! connection out of the pool and returns it within one transaction.
//! Sessions that must stay pinned for the whole of an operation — the
//! backfill's snapshot coordinator, a `CONCURRENTLY` index build — bypass
//! the pool through [`PgPool::dedicated`], because the pool is free to
//! recycle anything it hands out.

use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::config::PgConfig;
use crate::connection::{DirectConnection, PgConnection};
use crate::error::{PgError, PgResult};
use crate::retry::RetryPolicy;
use crate::statement::PreparedStatementCache;

/// Tuning for the pooled side of connection management.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Upper bound on pooled connections. The backfill keeps two
    /// sessions live at once (coordinator plus worker); leave headroom
    /// above that for phase transactions and catalog reads.
    pub max_connections: usize,
    /// How long a checkout may wait for a free slot before failing.
    pub acquire_timeout: Option<Duration>,
    /// Idle time after which a pooled connection is dropped.
    pub idle_timeout: Option<Duration>,
    /// Capacity of the prepared-statement cache shared by pooled
    /// connections. Backfill batch loops re-issue the same statements
    /// constantly, so this pays for itself quickly.
    pub statement_cache_size: usize,
    /// Retry policy for checkouts that fail transiently, typically a
    /// pooled connection found dead on checkout after a server restart.
    pub acquire_retry: RetryPolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(600)),
            statement_cache_size: 100,
            acquire_retry: RetryPolicy::default(),
        }
    }
}

/// Hands out database sessions for the migration engine.
#[derive(Clone)]
pub struct PgPool {
    inner: Pool,
    config: Arc<PgConfig>,
    statements: Arc<PreparedStatementCache>,
    acquire_retry: RetryPolicy,
}

impl PgPool {
    /// Build a pool from a connection configuration and pool tuning.
    pub async fn connect(config: PgConfig, options: PoolOptions) -> PgResult<Self> {
        let manager = Manager::from_config(
            config.to_pg_config(),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let inner = Pool::builder(manager)
            .max_size(options.max_connections)
            .wait_timeout(options.acquire_timeout)
            .create_timeout(options.acquire_timeout)
            .recycle_timeout(options.idle_timeout)
            .build()
            .map_err(|e| PgError::config(format!("failed to build pool: {}", e)))?;

        info!(
            host = %config.host,
            port = %config.port,
            database = %config.database,
            max_connections = %options.max_connections,
            "Connection pool ready"
        );

        Ok(Self {
            inner,
            config: Arc::new(config),
            statements: Arc::new(PreparedStatementCache::new(options.statement_cache_size)),
            acquire_retry: options.acquire_retry,
        })
    }

    /// Build a pool with default tuning from a database URL.
    pub async fn from_url(url: impl Into<String>) -> PgResult<Self> {
        Self::connect(PgConfig::from_url(url)?, PoolOptions::default()).await
    }

    /// Check out a pooled connection.
    ///
    /// A checkout that trips over a dead connection is re-issued under
    /// the acquisition retry policy; the pool replaces the casualty on
    /// the next attempt. Permanent failures (bad credentials, pool
    /// closed) surface immediately.
    pub async fn get(&self) -> PgResult<PgConnection> {
        self.acquire_retry
            .run(async || {
                debug!("Checking out pooled connection");
                let client = self.inner.get().await?;
                Ok(PgConnection::new(client, self.statements.clone()))
            })
            .await
    }

    /// Open a session outside the pool.
    ///
    /// The caller owns the connection until drop; the pool never recycles
    /// it. The backfill coordinator holds one of these for its entire run
    /// so the snapshot it exports stays valid, and concurrent index
    /// builds use one so their session-level settings never leak back
    /// into pooled connections.
    pub async fn dedicated(&self) -> PgResult<DirectConnection> {
        debug!("Opening dedicated connection");
        DirectConnection::connect(&self.config).await
    }

    /// Round-trip a trivial query to confirm the database is reachable.
    pub async fn ping(&self) -> PgResult<()> {
        let conn = self.get().await?;
        conn.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    /// A snapshot of pool occupancy.
    pub fn status(&self) -> PoolStatus {
        let status = self.inner.status();
        PoolStatus {
            idle: status.available as usize,
            open: status.size as usize,
            max: status.max_size as usize,
            waiting: status.waiting,
        }
    }

    /// The connection configuration the pool was built from.
    ///
    /// Dedicated connections are opened from this same configuration, so
    /// both kinds of session land on the same server and database.
    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    /// Close every pooled connection and refuse further checkouts.
    /// Dedicated connections already handed out are unaffected.
    pub fn close(&self) {
        self.inner.close();
        info!("Connection pool closed");
    }
}

/// Occupancy counters reported by [`PgPool::status`].
#[derive(Debug, Clone)]
pub struct PoolStatus {
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Connections currently open, idle or checked out.
    pub open: usize,
    /// The configured ceiling.
    pub max: usize,
    /// Tasks blocked waiting for a checkout.
    pub waiting: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_options_defaults() {
        let options = PoolOptions::default();
        assert_eq!(options.max_connections, 10);
        assert_eq!(options.statement_cache_size, 100);
        assert_eq!(options.acquire_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_acquire_retry_defaults_to_shared_policy() {
        let options = PoolOptions::default();
        let policy = RetryPolicy::default();
        assert_eq!(options.acquire_retry.max_attempts, policy.max_attempts);
        assert_eq!(options.acquire_retry.backoff, policy.backoff);
    }
}
