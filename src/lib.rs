//! # pgroll
//!
//! Zero-downtime, reversible schema migrations for PostgreSQL.
//!
//! pgroll applies each migration with the expand/contract pattern: the
//! old and new logical schemas coexist as two schemas of views over the
//! same physical tables, kept consistent by dual-write triggers and an
//! online backfill, until the migration is completed (or rolled back)
//! atomically. Clients choose a version by putting its view schema on
//! their `search_path`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pgroll::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::from_url("postgresql://localhost/app").await?;
//!     let engine = Engine::new(pool, EngineConfig::new());
//!     engine.init().await?;
//!
//!     let migration = Migration::from_json(include_str!("01_create_users.json"))?;
//!     let cancel = CancellationToken::new();
//!
//!     engine.start(&migration, None, &cancel).await?;
//!     engine.complete(&cancel).await?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

/// PostgreSQL connectivity: pooling, transactions, retry classification.
pub mod postgres {
    pub use pgroll_postgres::*;
}

/// The reflected schema model and catalog reader.
pub mod schema {
    pub use pgroll_schema::*;
}

/// The migration engine: operations, versioned views, dual-write
/// triggers, online backfill.
pub mod migrate {
    pub use pgroll_migrate::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::migrate::{Engine, EngineConfig, MigrateResult, Migration, MigrationError, Op};
    pub use crate::postgres::{PgConfig, PgPool};
    pub use crate::schema::{Schema, SchemaReflector};
}

// Re-export key types at the crate root
pub use migrate::{Engine, EngineConfig, Migration, MigrationError};
pub use postgres::PgPool;
pub use schema::Schema;
