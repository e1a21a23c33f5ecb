//! The dual-write trigger subsystem.
//!
//! While a migration is in progress, each column under expansion carries a
//! `BEFORE INSERT OR UPDATE FOR EACH ROW` trigger on its physical table.
//! The trigger inspects the caller's `search_path`: writers on the new
//! version have the old-shape value computed from the migration's `down`
//! expression, writers on the old version (or on the bare table) have the
//! shadow value computed from `up`. The trigger also clears the
//! needs-backfill flag where that column exists.

use indexmap::IndexMap;
use pgroll_schema::reserved;

use crate::sql::{quote_ident, quote_literal, quote_qualified};

/// One side of a dual write: an assignment of a rewritten user expression
/// to a physical column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    /// Physical column assigned by this expression.
    pub target: String,
    /// User-supplied SQL fragment over logical column names.
    pub body: String,
    /// Logical-to-physical column map used to rewrite bare references.
    pub map: IndexMap<String, String>,
}

impl Expression {
    /// Render the assignment statement for the trigger body.
    fn render(&self) -> String {
        format!(
            "NEW.{} := {};",
            quote_ident(&self.target),
            rewrite_expression(&self.body, &self.map)
        )
    }
}

/// The dual-write requirement of one operation for one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualWriteSpec {
    /// Physical table.
    pub table: String,
    /// Column under expansion; names the trigger.
    pub column: String,
    /// Assignment for writers on the old version (fills the new shape).
    pub up: Option<Expression>,
    /// Assignment for writers on the new version (fills the old shape).
    pub down: Option<Expression>,
}

/// The trigger (and trigger function) name for a column under expansion.
pub fn trigger_name(table: &str, column: &str) -> String {
    format!("_pgroll_trigger_{}_{}", table, column)
}

/// Group dual-write specs by (table, column), preserving operation order.
///
/// Multiple operations expanding the same column compose: their
/// assignments are appended inside the same trigger branch, so later
/// expressions see earlier results.
pub fn group_dual_writes(specs: Vec<DualWriteSpec>) -> IndexMap<(String, String), Vec<DualWriteSpec>> {
    let mut groups: IndexMap<(String, String), Vec<DualWriteSpec>> = IndexMap::new();
    for spec in specs {
        groups
            .entry((spec.table.clone(), spec.column.clone()))
            .or_default()
            .push(spec);
    }
    groups
}

/// Render the trigger function and trigger DDL for one (table, column)
/// group.
pub fn build_trigger_sql(
    schema: &str,
    new_version_schema: &str,
    specs: &[DualWriteSpec],
    clear_backfill_flag: bool,
) -> String {
    let table = &specs[0].table;
    let column = &specs[0].column;
    let name = trigger_name(table, column);
    let function = quote_qualified(schema, &name);
    let table_q = quote_qualified(schema, table);

    let render_branch = |pick: fn(&DualWriteSpec) -> Option<&Expression>| {
        let statements: Vec<String> = specs
            .iter()
            .filter_map(pick)
            .map(Expression::render)
            .collect();
        if statements.is_empty() {
            "NULL;".to_string()
        } else {
            statements.join("\n        ")
        }
    };

    let down_branch = render_branch(|s| s.down.as_ref());
    let up_branch = render_branch(|s| s.up.as_ref());

    let clear_flag = if clear_backfill_flag {
        format!(
            "\n    NEW.{} := false;",
            quote_ident(reserved::NEEDS_BACKFILL_COLUMN)
        )
    } else {
        String::new()
    };

    format!(
        r#"CREATE OR REPLACE FUNCTION {function}()
RETURNS trigger
LANGUAGE plpgsql
AS $pgroll$
DECLARE
    caller_path text := pg_catalog.current_setting('search_path');
BEGIN
    IF strpos(caller_path, {new_version}) > 0 THEN
        {down_branch}
    ELSE
        {up_branch}
    END IF;{clear_flag}
    RETURN NEW;
END;
$pgroll$;

DROP TRIGGER IF EXISTS {trigger} ON {table};
CREATE TRIGGER {trigger}
    BEFORE INSERT OR UPDATE ON {table}
    FOR EACH ROW EXECUTE FUNCTION {function}();
"#,
        function = function,
        new_version = quote_literal(new_version_schema),
        down_branch = down_branch,
        up_branch = up_branch,
        clear_flag = clear_flag,
        trigger = quote_ident(&name),
        table = table_q,
    )
}

/// Render the teardown DDL for one (table, column) trigger.
pub fn drop_trigger_sql(schema: &str, table: &str, column: &str) -> String {
    let name = trigger_name(table, column);
    format!(
        "DROP TRIGGER IF EXISTS {trigger} ON {table};\nDROP FUNCTION IF EXISTS {function}();",
        trigger = quote_ident(&name),
        table = quote_qualified(schema, table),
        function = quote_qualified(schema, &name),
    )
}

/// DDL adding the needs-backfill flag column to a table, if absent.
pub fn ensure_backfill_flag_sql(schema: &str, table: &str) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} BOOLEAN NOT NULL DEFAULT true",
        quote_qualified(schema, table),
        quote_ident(reserved::NEEDS_BACKFILL_COLUMN),
    )
}

/// DDL dropping the needs-backfill flag column from a table, if present.
pub fn drop_backfill_flag_sql(schema: &str, table: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
        quote_qualified(schema, table),
        quote_ident(reserved::NEEDS_BACKFILL_COLUMN),
    )
}

/// Rewrite bare column references in a user expression to `NEW."<col>"`.
///
/// The map keys are the logical column names visible to the expression;
/// values are the physical columns they resolve to. String literals,
/// dollar-quoted bodies, qualified references, and function names are left
/// untouched. Quoted identifiers are rewritten when they match exactly;
/// unquoted identifiers match case-insensitively, following the server's
/// case folding.
pub fn rewrite_expression(expr: &str, map: &IndexMap<String, String>) -> String {
    rewrite(expr, map, "NEW.")
}

/// Rewrite bare column references to their mapped physical names, without
/// the `NEW.` qualifier. Used to point constraint expressions at shadow
/// columns.
pub fn substitute_columns(expr: &str, map: &IndexMap<String, String>) -> String {
    rewrite(expr, map, "")
}

fn rewrite(expr: &str, map: &IndexMap<String, String>, prefix: &str) -> String {
    let mut out = String::with_capacity(expr.len() + 16);
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        // String literal: copy through, honoring '' escapes.
        if c == '\'' {
            out.push(c);
            i += 1;
            while i < chars.len() {
                out.push(chars[i]);
                if chars[i] == '\'' {
                    if i + 1 < chars.len() && chars[i + 1] == '\'' {
                        out.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            continue;
        }

        // Quoted identifier: rewrite on exact match.
        if c == '"' {
            let start = i;
            i += 1;
            let mut ident = String::new();
            while i < chars.len() {
                if chars[i] == '"' {
                    if i + 1 < chars.len() && chars[i + 1] == '"' {
                        ident.push('"');
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                ident.push(chars[i]);
                i += 1;
            }
            let qualified = preceded_by_dot(&chars, start);
            match map.get(&ident) {
                Some(physical) if !qualified => {
                    out.push_str(prefix);
                    out.push_str(&quote_ident(physical));
                }
                _ => {
                    for ch in chars[start..i].iter() {
                        out.push(*ch);
                    }
                }
            }
            continue;
        }

        // Bare identifier.
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let lowered = ident.to_lowercase();

            let qualified = preceded_by_dot(&chars, start) || followed_by(&chars, i, '.');
            let call = followed_by(&chars, i, '(');

            match map.get(&lowered) {
                Some(physical) if !qualified && !call => {
                    out.push_str(prefix);
                    out.push_str(&quote_ident(physical));
                }
                _ => out.push_str(&ident),
            }
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}

/// Whether the last non-space character before `index` is a dot.
fn preceded_by_dot(chars: &[char], index: usize) -> bool {
    chars[..index]
        .iter()
        .rev()
        .find(|c| !c.is_whitespace())
        .is_some_and(|c| *c == '.')
}

/// Whether the first non-space character at or after `index` is `needle`.
fn followed_by(chars: &[char], index: usize, needle: char) -> bool {
    chars[index..]
        .iter()
        .find(|c| !c.is_whitespace())
        .is_some_and(|c| *c == needle)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn name_map() -> IndexMap<String, String> {
        IndexMap::from([("name".to_string(), "name".to_string())])
    }

    #[test]
    fn test_rewrite_bare_reference() {
        let out = rewrite_expression("COALESCE(name, 'placeholder')", &name_map());
        assert_eq!(out, "COALESCE(NEW.\"name\", 'placeholder')");
    }

    #[test]
    fn test_rewrite_leaves_function_names() {
        let map = IndexMap::from([("upper".to_string(), "upper".to_string())]);
        let out = rewrite_expression("upper(other)", &map);
        assert_eq!(out, "upper(other)");
    }

    #[test]
    fn test_rewrite_leaves_string_literals() {
        let out = rewrite_expression("'name' || name", &name_map());
        assert_eq!(out, "'name' || NEW.\"name\"");
    }

    #[test]
    fn test_rewrite_handles_escaped_quotes_in_literals() {
        let out = rewrite_expression("'it''s name' || name", &name_map());
        assert_eq!(out, "'it''s name' || NEW.\"name\"");
    }

    #[test]
    fn test_rewrite_leaves_qualified_references() {
        let out = rewrite_expression("users.name", &name_map());
        assert_eq!(out, "users.name");
    }

    #[test]
    fn test_rewrite_is_case_insensitive_for_bare_idents() {
        let out = rewrite_expression("NAME", &name_map());
        assert_eq!(out, "NEW.\"name\"");
    }

    #[test]
    fn test_rewrite_quoted_identifier_exact_match() {
        let out = rewrite_expression("\"name\"", &name_map());
        assert_eq!(out, "NEW.\"name\"");

        // A quoted identifier with different case is a different column.
        let out = rewrite_expression("\"NAME\"", &name_map());
        assert_eq!(out, "\"NAME\"");
    }

    #[test]
    fn test_rewrite_maps_to_shadow_column() {
        let map = IndexMap::from([("name".to_string(), "_pgroll_new_name".to_string())]);
        let out = rewrite_expression("name", &map);
        assert_eq!(out, "NEW.\"_pgroll_new_name\"");
    }

    fn spec(up: Option<Expression>, down: Option<Expression>) -> DualWriteSpec {
        DualWriteSpec {
            table: "users".to_string(),
            column: "name".to_string(),
            up,
            down,
        }
    }

    fn up_expr() -> Expression {
        Expression {
            target: "_pgroll_new_name".to_string(),
            body: "COALESCE(name, 'placeholder')".to_string(),
            map: name_map(),
        }
    }

    fn down_expr() -> Expression {
        Expression {
            target: "name".to_string(),
            body: "name".to_string(),
            map: IndexMap::from([("name".to_string(), "_pgroll_new_name".to_string())]),
        }
    }

    #[test]
    fn test_build_trigger_sql_branches_on_search_path() {
        let specs = vec![spec(Some(up_expr()), Some(down_expr()))];
        let sql = build_trigger_sql("public", "public_02_alter", &specs, false);

        assert!(sql.contains("strpos(caller_path, 'public_02_alter') > 0"));
        // New-version writers get the old column written from down.
        assert!(sql.contains("NEW.\"name\" := NEW.\"_pgroll_new_name\";"));
        // Old-version writers get the shadow written from up.
        assert!(
            sql.contains("NEW.\"_pgroll_new_name\" := COALESCE(NEW.\"name\", 'placeholder');")
        );
        assert!(sql.contains("BEFORE INSERT OR UPDATE ON \"public\".\"users\""));
        assert!(sql.contains("\"_pgroll_trigger_users_name\""));
        assert!(!sql.contains("_pgroll_needs_backfill"));
    }

    #[test]
    fn test_build_trigger_sql_clears_backfill_flag() {
        let specs = vec![spec(Some(up_expr()), None)];
        let sql = build_trigger_sql("public", "public_02_alter", &specs, true);
        assert!(sql.contains("NEW.\"_pgroll_needs_backfill\" := false;"));
        // The empty branch still parses.
        assert!(sql.contains("NULL;"));
    }

    #[test]
    fn test_dual_writes_compose_in_operation_order() {
        let mut second = up_expr();
        second.body = "upper(name)".to_string();
        let specs = vec![spec(Some(up_expr()), None), spec(Some(second), None)];
        let sql = build_trigger_sql("public", "public_02_alter", &specs, false);

        let first_pos = sql.find("COALESCE").unwrap();
        let second_pos = sql.find("upper(").unwrap();
        assert!(first_pos < second_pos);
    }

    #[test]
    fn test_group_dual_writes_preserves_order() {
        let specs = vec![
            spec(Some(up_expr()), None),
            DualWriteSpec {
                table: "users".to_string(),
                column: "email".to_string(),
                up: None,
                down: None,
            },
            spec(None, Some(down_expr())),
        ];
        let groups = group_dual_writes(specs);
        assert_eq!(groups.len(), 2);
        let keys: Vec<_> = groups.keys().collect();
        assert_eq!(keys[0].1, "name");
        assert_eq!(keys[1].1, "email");
        assert_eq!(groups[&("users".to_string(), "name".to_string())].len(), 2);
    }

    #[test]
    fn test_drop_trigger_sql() {
        let sql = drop_trigger_sql("public", "users", "name");
        assert!(sql.contains("DROP TRIGGER IF EXISTS \"_pgroll_trigger_users_name\""));
        assert!(sql.contains("DROP FUNCTION IF EXISTS \"public\".\"_pgroll_trigger_users_name\"()"));
    }
}
