//! Catalog reflection.
//!
//! Reads the live `pg_catalog` state of one database schema into the
//! in-memory [`Schema`] model. Reserved tables and columns (shadow
//! columns, backfill flags, batch helpers) are filtered out so the model
//! always describes the logical shape.

use std::collections::BTreeMap;

use async_trait::async_trait;
use pgroll_postgres::PgPool;
use tracing::debug;

use crate::error::SchemaResult;
use crate::model::{
    CheckConstraint, Column, ForeignKey, Index, Schema, Table, UniqueConstraint,
};
use crate::reserved;

/// Raw table information from the catalog.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Table comment.
    pub comment: Option<String>,
}

/// Raw column information from the catalog.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Formatted type, e.g. `character varying(255)`.
    pub data_type: String,
    /// Whether the column is nullable.
    pub nullable: bool,
    /// Default value expression.
    pub default: Option<String>,
    /// Column comment.
    pub comment: Option<String>,
    /// Ordinal position (1-based).
    pub ordinal: i16,
}

/// Raw constraint information from the catalog.
#[derive(Debug, Clone)]
pub struct ConstraintInfo {
    /// Constraint name.
    pub name: String,
    /// Constraint type code: `p`, `u`, `c`, or `f`.
    pub constraint_type: String,
    /// Constrained columns, in key order.
    pub columns: Vec<String>,
    /// Full definition as reported by `pg_get_constraintdef`.
    pub definition: String,
    /// Referenced table (foreign keys).
    pub referenced_table: Option<String>,
    /// Referenced columns (foreign keys).
    pub referenced_columns: Option<Vec<String>>,
    /// ON DELETE action code (foreign keys).
    pub on_delete: Option<String>,
    /// ON UPDATE action code (foreign keys).
    pub on_update: Option<String>,
}

/// Raw index information from the catalog.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    /// Index name.
    pub name: String,
    /// Indexed columns.
    pub columns: Vec<String>,
    /// Whether the index is unique.
    pub unique: bool,
    /// Whether this is the primary key index.
    pub primary: bool,
    /// Index method (btree, hash, ...).
    pub method: String,
}

/// Source of raw catalog data.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// The server version as an integer, e.g. 150004.
    async fn server_version_num(&self) -> SchemaResult<i32>;

    /// All ordinary tables in a schema.
    async fn tables(&self, schema: &str) -> SchemaResult<Vec<TableInfo>>;

    /// Columns of one table.
    async fn columns(&self, schema: &str, table: &str) -> SchemaResult<Vec<ColumnInfo>>;

    /// Constraints of one table.
    async fn constraints(&self, schema: &str, table: &str) -> SchemaResult<Vec<ConstraintInfo>>;

    /// Indexes of one table.
    async fn indexes(&self, schema: &str, table: &str) -> SchemaResult<Vec<IndexInfo>>;
}

/// Catalog queries.
mod queries {
    /// Ordinary tables in a schema, with comments.
    pub const TABLES: &str = r#"
        SELECT
            c.relname AS table_name,
            obj_description(c.oid, 'pg_class') AS comment
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1 AND c.relkind = 'r'
        ORDER BY c.relname
    "#;

    /// Columns of a table, in ordinal order.
    pub const COLUMNS: &str = r#"
        SELECT
            a.attname AS column_name,
            format_type(a.atttypid, a.atttypmod) AS data_type,
            NOT a.attnotnull AS is_nullable,
            pg_get_expr(d.adbin, d.adrelid) AS column_default,
            col_description(a.attrelid, a.attnum) AS comment,
            a.attnum AS ordinal
        FROM pg_attribute a
        JOIN pg_class c ON c.oid = a.attrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
        WHERE n.nspname = $1 AND c.relname = $2
          AND a.attnum > 0 AND NOT a.attisdropped
        ORDER BY a.attnum
    "#;

    /// Constraints of a table.
    pub const CONSTRAINTS: &str = r#"
        SELECT
            con.conname AS constraint_name,
            con.contype::text AS constraint_type,
            pg_get_constraintdef(con.oid) AS definition,
            ARRAY(
                SELECT a.attname
                FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                ORDER BY k.ord
            ) AS columns,
            confrel.relname AS referenced_table,
            CASE WHEN con.contype = 'f' THEN
                ARRAY(
                    SELECT a.attname
                    FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
                    JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                )
            END AS referenced_columns,
            con.confdeltype::text AS on_delete,
            con.confupdtype::text AS on_update
        FROM pg_constraint con
        JOIN pg_class c ON c.oid = con.conrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        LEFT JOIN pg_class confrel ON confrel.oid = con.confrelid
        WHERE n.nspname = $1 AND c.relname = $2
        ORDER BY con.conname
    "#;

    /// Indexes of a table.
    pub const INDEXES: &str = r#"
        SELECT
            i.relname AS index_name,
            array_agg(a.attname ORDER BY array_position(ix.indkey, a.attnum)) AS columns,
            ix.indisunique AS is_unique,
            ix.indisprimary AS is_primary,
            am.amname AS index_method
        FROM pg_index ix
        JOIN pg_class i ON ix.indexrelid = i.oid
        JOIN pg_class t ON ix.indrelid = t.oid
        JOIN pg_namespace n ON t.relnamespace = n.oid
        JOIN pg_am am ON i.relam = am.oid
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
        WHERE n.nspname = $1 AND t.relname = $2
        GROUP BY i.relname, ix.indisunique, ix.indisprimary, am.amname
        ORDER BY i.relname
    "#;

    /// Integer server version.
    pub const SERVER_VERSION: &str =
        "SELECT current_setting('server_version_num')::integer AS version";
}

/// Catalog source backed by a connection pool.
pub struct PgCatalogSource {
    pool: PgPool,
}

impl PgCatalogSource {
    /// Create a new catalog source.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogSource for PgCatalogSource {
    async fn server_version_num(&self) -> SchemaResult<i32> {
        let conn = self.pool.get().await?;
        let row = conn.query_one(queries::SERVER_VERSION, &[]).await?;
        Ok(row.get("version"))
    }

    async fn tables(&self, schema: &str) -> SchemaResult<Vec<TableInfo>> {
        let conn = self.pool.get().await?;
        let rows = conn.query(queries::TABLES, &[&schema]).await?;
        Ok(rows
            .into_iter()
            .map(|row| TableInfo {
                name: row.get("table_name"),
                comment: row.get("comment"),
            })
            .collect())
    }

    async fn columns(&self, schema: &str, table: &str) -> SchemaResult<Vec<ColumnInfo>> {
        let conn = self.pool.get().await?;
        let rows = conn.query(queries::COLUMNS, &[&schema, &table]).await?;
        Ok(rows
            .into_iter()
            .map(|row| ColumnInfo {
                name: row.get("column_name"),
                data_type: row.get("data_type"),
                nullable: row.get("is_nullable"),
                default: row.get("column_default"),
                comment: row.get("comment"),
                ordinal: row.get("ordinal"),
            })
            .collect())
    }

    async fn constraints(&self, schema: &str, table: &str) -> SchemaResult<Vec<ConstraintInfo>> {
        let conn = self.pool.get().await?;
        let rows = conn.query(queries::CONSTRAINTS, &[&schema, &table]).await?;
        Ok(rows
            .into_iter()
            .map(|row| ConstraintInfo {
                name: row.get("constraint_name"),
                constraint_type: row.get("constraint_type"),
                definition: row.get("definition"),
                columns: row.get("columns"),
                referenced_table: row.get("referenced_table"),
                referenced_columns: row.get("referenced_columns"),
                on_delete: row.get("on_delete"),
                on_update: row.get("on_update"),
            })
            .collect())
    }

    async fn indexes(&self, schema: &str, table: &str) -> SchemaResult<Vec<IndexInfo>> {
        let conn = self.pool.get().await?;
        let rows = conn.query(queries::INDEXES, &[&schema, &table]).await?;
        Ok(rows
            .into_iter()
            .map(|row| IndexInfo {
                name: row.get("index_name"),
                columns: row.get("columns"),
                unique: row.get("is_unique"),
                primary: row.get("is_primary"),
                method: row.get("index_method"),
            })
            .collect())
    }
}

/// Reflects one database schema into the model.
pub struct SchemaReflector {
    source: Box<dyn CatalogSource>,
}

impl SchemaReflector {
    /// Create a reflector over a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            source: Box::new(PgCatalogSource::new(pool)),
        }
    }

    /// Create a reflector over a custom catalog source.
    pub fn from_source(source: Box<dyn CatalogSource>) -> Self {
        Self { source }
    }

    /// The server version as an integer, e.g. 150004.
    pub async fn server_version_num(&self) -> SchemaResult<i32> {
        self.source.server_version_num().await
    }

    /// Read the named schema into the model.
    pub async fn reflect(&self, schema_name: &str) -> SchemaResult<Schema> {
        let mut builder = SchemaBuilder::new(schema_name);

        for table in self.source.tables(schema_name).await? {
            if reserved::is_reserved(&table.name) {
                debug!(table = %table.name, "Skipping reserved table");
                continue;
            }
            let columns = self.source.columns(schema_name, &table.name).await?;
            let constraints = self.source.constraints(schema_name, &table.name).await?;
            let indexes = self.source.indexes(schema_name, &table.name).await?;
            builder.add_table(table, columns, constraints, indexes);
        }

        Ok(builder.build())
    }
}

/// Assembles raw catalog rows into the model.
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    /// Create a builder for the named schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: Schema::new(name),
        }
    }

    /// Add one table's raw catalog data.
    pub fn add_table(
        &mut self,
        info: TableInfo,
        columns: Vec<ColumnInfo>,
        constraints: Vec<ConstraintInfo>,
        indexes: Vec<IndexInfo>,
    ) {
        let mut table = Table::new(&info.name);
        table.comment = info.comment;

        let mut ordered = columns;
        ordered.sort_by_key(|c| c.ordinal);
        for column in ordered {
            if reserved::is_reserved(&column.name) {
                continue;
            }
            table.columns.push(Column {
                name: column.name,
                data_type: column.data_type,
                nullable: column.nullable,
                default: column.default,
                unique: false,
                comment: column.comment,
            });
        }

        for constraint in constraints {
            match constraint.constraint_type.as_str() {
                "p" => {
                    table.primary_key = constraint.columns;
                }
                "u" => {
                    if constraint.columns.len() == 1
                        && let Some(col) = table.column_mut(&constraint.columns[0])
                    {
                        col.unique = true;
                    }
                    table.unique_constraints.insert(
                        constraint.name.clone(),
                        UniqueConstraint {
                            name: constraint.name,
                            columns: constraint.columns,
                        },
                    );
                }
                "c" => {
                    table.check_constraints.insert(
                        constraint.name.clone(),
                        CheckConstraint {
                            name: constraint.name,
                            columns: constraint.columns,
                            definition: constraint.definition,
                        },
                    );
                }
                "f" => {
                    table.foreign_keys.insert(
                        constraint.name.clone(),
                        ForeignKey {
                            name: constraint.name,
                            columns: constraint.columns,
                            referenced_table: constraint.referenced_table.unwrap_or_default(),
                            referenced_columns: constraint.referenced_columns.unwrap_or_default(),
                            on_delete: constraint.on_delete.as_deref().map(action_name),
                            on_update: constraint.on_update.as_deref().map(action_name),
                        },
                    );
                }
                _ => {}
            }
        }

        let mut index_map = BTreeMap::new();
        for index in indexes {
            if index.primary {
                continue;
            }
            index_map.insert(
                index.name.clone(),
                Index {
                    name: index.name,
                    columns: index.columns,
                    unique: index.unique,
                    method: index.method,
                },
            );
        }
        table.indexes = index_map;

        self.schema.tables.insert(table.name.clone(), table);
    }

    /// Finish and return the schema.
    pub fn build(self) -> Schema {
        self.schema
    }
}

/// Map a `pg_constraint` action code to its SQL spelling.
fn action_name(code: &str) -> String {
    match code {
        "a" => "NO ACTION",
        "r" => "RESTRICT",
        "c" => "CASCADE",
        "n" => "SET NULL",
        "d" => "SET DEFAULT",
        other => other,
    }
    .to_string()
}
