//! Reserved identifiers.
//!
//! The engine claims a handful of identifier prefixes inside the target
//! database. User-supplied table, column, constraint, and index names must
//! not use them.

/// Prefixes reserved for engine-managed objects.
pub const RESERVED_PREFIXES: &[&str] = &["_pgroll_", "pgroll_", "batch_"];

/// Prefix of the hidden column that carries the other version's value.
pub const SHADOW_COLUMN_PREFIX: &str = "_pgroll_new_";

/// Boolean column added to tables that are backfilled without identity
/// columns.
pub const NEEDS_BACKFILL_COLUMN: &str = "_pgroll_needs_backfill";

/// Whether an identifier collides with the reserved namespace.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// The shadow-column name for a physical column.
pub fn shadow_column(column: &str) -> String {
    format!("{}{}", SHADOW_COLUMN_PREFIX, column)
}
