//! SQL rendering helpers.
//!
//! Every identifier and literal that ends up in generated SQL goes through
//! these two quoting functions; nothing else in this crate concatenates
//! user-supplied names into statements.

use pgroll_schema::reserved;

use crate::error::{MigrateResult, MigrationError};

/// Quote an identifier for use in SQL.
///
/// Always quotes, doubling any embedded double quotes, so reserved words
/// and mixed-case names are safe.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a schema-qualified identifier.
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Quote a string literal for use in SQL.
///
/// Single quotes are doubled; backslashes are left alone, which is correct
/// under `standard_conforming_strings` (on since PostgreSQL 9.1).
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Reject identifiers that collide with the engine's reserved namespace.
pub fn check_identifier(name: &str) -> MigrateResult<()> {
    if name.is_empty() {
        return Err(MigrationError::validation(
            "identifier must not be empty".to_string(),
        ));
    }
    if reserved::is_reserved(name) {
        return Err(MigrationError::validation(format!(
            "identifier '{}' uses a reserved prefix",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
        assert_eq!(quote_ident("select"), "\"select\"");
    }

    #[test]
    fn test_quote_qualified() {
        assert_eq!(quote_qualified("public", "users"), "\"public\".\"users\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("abc"), "'abc'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("a\\b"), "'a\\b'");
    }

    #[test]
    fn test_check_identifier() {
        assert!(check_identifier("users").is_ok());
        assert!(check_identifier("").is_err());
        assert!(check_identifier("_pgroll_new_name").is_err());
        assert!(check_identifier("batch_users").is_err());
    }
}
