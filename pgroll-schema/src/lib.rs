//! # pgroll-schema
//!
//! The reflected schema model for the pgroll migration engine.
//!
//! This crate provides:
//! - An in-memory model of one database schema (tables, columns,
//!   constraints, primary keys, indexes), serializable so it can be
//!   persisted alongside migration history
//! - A catalog reflector that reads the live `pg_catalog` state into the
//!   model
//! - The reserved-identifier rules that keep engine-managed objects out of
//!   the logical model
//!
//! ## Example
//!
//! ```rust,ignore
//! use pgroll_schema::SchemaReflector;
//!
//! let reflector = SchemaReflector::new(pool);
//! let schema = reflector.reflect("public").await?;
//! for name in schema.table_names() {
//!     println!("{}", name);
//! }
//! ```

pub mod error;
pub mod model;
pub mod reflect;
pub mod reserved;

pub use error::{SchemaError, SchemaResult};
pub use model::{
    CheckConstraint, Column, ForeignKey, Index, Schema, Table, UniqueConstraint,
};
pub use reflect::{
    CatalogSource, ColumnInfo, ConstraintInfo, IndexInfo, PgCatalogSource, SchemaBuilder,
    SchemaReflector, TableInfo,
};
