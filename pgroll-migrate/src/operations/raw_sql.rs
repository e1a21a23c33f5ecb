//! Raw SQL escape hatch.

use async_trait::async_trait;
use pgroll_postgres::Executor;
use pgroll_schema::Schema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MigrateResult, MigrationError};
use crate::operations::{Operation, OperationContext};

/// Run arbitrary SQL.
///
/// `up` runs at `start`, `down` at `rollback`. The operation takes part
/// in `complete` only when it declares `on_complete` SQL, which must be
/// idempotent. The engine cannot see through raw SQL, so its effects are
/// not reflected in view projections or the virtual schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSql {
    /// SQL run at `start`.
    pub up: String,
    /// SQL run at `rollback`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<String>,
    /// Idempotent SQL run at `complete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<String>,
}

#[async_trait]
impl Operation for RawSql {
    fn name(&self) -> &'static str {
        "raw_sql"
    }

    fn validate(&self, _schema: &Schema) -> MigrateResult<()> {
        if self.up.trim().is_empty() {
            return Err(MigrationError::validation(
                "raw_sql requires a non-empty 'up' statement".to_string(),
            ));
        }
        Ok(())
    }

    async fn start(&self, exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        exec.batch_execute(&self.up).await?;
        Ok(())
    }

    async fn complete(&self, exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        if let Some(sql) = &self.on_complete {
            exec.batch_execute(sql).await?;
        }
        Ok(())
    }

    async fn rollback(&self, exec: &Executor<'_>, _ctx: &OperationContext<'_>) -> MigrateResult<()> {
        match &self.down {
            Some(sql) => {
                exec.batch_execute(sql).await?;
            }
            None => {
                warn!("raw_sql operation has no 'down'; leaving its effects in place");
            }
        }
        Ok(())
    }

    fn update_schema(&self, _schema: &mut Schema) -> MigrateResult<()> {
        // Raw SQL is opaque; later operations validate against the schema
        // as it was.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_up() {
        let op = RawSql {
            up: "  ".to_string(),
            down: None,
            on_complete: None,
        };
        assert!(op.validate(&Schema::new("public")).is_err());
    }

    #[test]
    fn test_round_trips_through_json() {
        let op = RawSql {
            up: "CREATE SEQUENCE s".to_string(),
            down: Some("DROP SEQUENCE s".to_string()),
            on_complete: Some("SELECT 1".to_string()),
        };
        let json = serde_json::to_string(&op).unwrap();
        let restored: RawSql = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.up, op.up);
        assert_eq!(restored.on_complete, op.on_complete);
    }
}
