//! # pgroll-migrate
//!
//! Zero-downtime schema migrations for PostgreSQL.
//!
//! A migration describes one logical schema change as an ordered list of
//! operations. The engine applies it with the expand/contract pattern:
//!
//! - **start** expands the physical schema (shadow columns, `NOT VALID`
//!   constraints), installs dual-write triggers, backfills pre-existing
//!   rows in bounded batches, and materializes a schema-of-views for the
//!   new version next to the old one.
//! - Clients pick a version by putting its view schema on their
//!   `search_path`; both versions stay readable and writable for as long
//!   as the rollout takes.
//! - **complete** validates constraints, promotes shadow columns, drops
//!   the old version, and records history, all in one transaction.
//! - **rollback** tears the expansion down and leaves the old schema
//!   untouched.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pgroll_migrate::{Engine, EngineConfig, Migration};
//! use pgroll_postgres::PgPool;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::from_url("postgresql://localhost/app").await?;
//!     let engine = Engine::new(pool, EngineConfig::new());
//!
//!     engine.init().await?;
//!
//!     let migration = Migration::from_json(r#"{
//!         "name": "02_set_name_not_null",
//!         "operations": [{
//!             "kind": "alter_column",
//!             "table": "users",
//!             "column": "name",
//!             "nullable": false,
//!             "up": "COALESCE(name, 'placeholder')",
//!             "down": "name"
//!         }]
//!     }"#)?;
//!
//!     let cancel = CancellationToken::new();
//!     engine.start(&migration, None, &cancel).await?;
//!     // ... applications roll over to the new version ...
//!     engine.complete(&cancel).await?;
//!     Ok(())
//! }
//! ```

pub mod backfill;
pub mod engine;
pub mod error;
pub mod migration;
pub mod operations;
pub mod sql;
pub mod state;
pub mod trigger;
pub mod views;

pub use backfill::{Backfill, BackfillConfig, BackfillStrategy, Progress};
pub use engine::{Engine, EngineConfig, MigrationStatus};
pub use error::{MigrateResult, MigrationError};
pub use migration::{Migration, MigrationRecord, MigrationState};
pub use operations::{Op, Operation, OperationContext};
pub use state::{DEFAULT_STATE_SCHEMA, STATE_VERSION, StateStore};
pub use views::{ViewPlan, version_schema_name};
