//! Prepared statement caching.

use std::collections::HashSet;
use std::sync::RwLock;

use deadpool_postgres::{Object, Transaction};
use tokio_postgres::Statement;
use tracing::debug;

use crate::error::PgResult;

/// A cache for prepared statements, keyed by SQL text.
///
/// Statements are prepared lazily per connection; the cache tracks which
/// SQL strings have been seen so repeated statements (batch loops in
/// particular) reuse the server-side prepared plan.
pub struct PreparedStatementCache {
    max_size: usize,
    seen: RwLock<HashSet<String>>,
}

impl PreparedStatementCache {
    /// Create a new statement cache with the given maximum size.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            seen: RwLock::new(HashSet::new()),
        }
    }

    /// Get or prepare a statement for the given SQL.
    pub async fn get_or_prepare(&self, client: &Object, sql: &str) -> PgResult<Statement> {
        self.record(sql);
        let stmt = client.prepare_cached(sql).await?;
        Ok(stmt)
    }

    /// Get or prepare a statement within a transaction.
    pub async fn get_or_prepare_in_txn(
        &self,
        txn: &Transaction<'_>,
        sql: &str,
    ) -> PgResult<Statement> {
        self.record(sql);
        let stmt = txn.prepare_cached(sql).await?;
        Ok(stmt)
    }

    fn record(&self, sql: &str) {
        let is_cached = {
            let seen = self.seen.read().unwrap();
            seen.contains(sql)
        };

        if is_cached {
            debug!(sql = %sql, "Using cached prepared statement");
            return;
        }

        debug!(sql = %sql, "Preparing new statement");
        let mut seen = self.seen.write().unwrap();
        if seen.len() >= self.max_size {
            // Simple eviction: drop half the tracked entries. The server-side
            // plans stay alive per connection either way.
            let to_remove: Vec<_> = seen.iter().take(seen.len() / 2).cloned().collect();
            for key in to_remove {
                seen.remove(&key);
            }
        }
        seen.insert(sql.to_string());
    }

    /// Number of tracked statements.
    pub fn len(&self) -> usize {
        self.seen.read().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
