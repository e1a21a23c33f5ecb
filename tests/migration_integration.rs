//! Integration tests for migration documents and operation sequencing.
//!
//! These tests exercise the public surface end to end without a live
//! database: documents are parsed, validated against an in-memory schema,
//! and their virtual effects checked operation by operation.

use pgroll::migrate::{Migration, Op, Operation as _};
use pgroll::schema::{Column, Schema, Table};

/// Apply a migration's operations to a schema the way the engine does
/// during validation: each operation validates against the schema as
/// evolved by its predecessors.
fn apply(migration: &Migration, schema: &mut Schema) {
    for op in &migration.operations {
        let operation = op.as_operation();
        operation.validate(schema).expect("operation should validate");
        operation
            .update_schema(schema)
            .expect("operation should apply");
    }
}

fn users_schema() -> Schema {
    let mut users = Table::new("users");
    users
        .add_column(Column::new("id", "integer").not_null())
        .unwrap();
    users
        .add_column(Column::new("name", "character varying(255)").unique())
        .unwrap();
    users.primary_key = vec!["id".to_string()];

    let mut schema = Schema::new("public");
    schema.add_table(users).unwrap();
    schema
}

/// A first migration creating a table.
#[test]
fn test_create_users_migration() {
    let migration = Migration::from_json(
        r#"{
            "name": "01_create_users",
            "operations": [{
                "kind": "create_table",
                "name": "users",
                "columns": [
                    {"name": "id", "type": "integer", "pk": true, "nullable": false},
                    {"name": "name", "type": "varchar(255)", "unique": true}
                ]
            }]
        }"#,
    )
    .unwrap();

    let mut schema = Schema::new("public");
    apply(&migration, &mut schema);

    let users = schema.table("users").unwrap();
    assert_eq!(users.primary_key, vec!["id".to_string()]);
    assert!(users.column("name").unwrap().nullable);
    assert!(users.column("name").unwrap().unique);
}

/// A follow-up migration making a column NOT NULL through a shadow
/// column with up/down expressions.
#[test]
fn test_set_not_null_migration() {
    let migration = Migration::from_json(
        r#"{
            "name": "02_set_name_not_null",
            "parent": "01_create_users",
            "operations": [{
                "kind": "alter_column",
                "table": "users",
                "column": "name",
                "nullable": false,
                "up": "COALESCE(name, 'placeholder')",
                "down": "name"
            }]
        }"#,
    )
    .unwrap();

    assert_eq!(migration.parent.as_deref(), Some("01_create_users"));

    let op = migration.operations[0].as_operation();
    assert!(op.requires_backfill());
    assert_eq!(op.backfill_table(), Some("users"));

    let mut schema = users_schema();
    apply(&migration, &mut schema);
    assert!(!schema.table("users").unwrap().column("name").unwrap().nullable);
}

/// A rename migration maps both logical names onto one physical column
/// and needs no backfill.
#[test]
fn test_rename_column_migration() {
    let migration = Migration::from_json(
        r#"{
            "name": "03_rename_name",
            "operations": [{
                "kind": "alter_column",
                "table": "users",
                "column": "name",
                "name": "full_name"
            }]
        }"#,
    )
    .unwrap();

    let op = migration.operations[0].as_operation();
    assert!(!op.requires_backfill());

    let renames = op.column_renames();
    assert_eq!(renames["users"]["name"], "full_name");

    let mut schema = users_schema();
    apply(&migration, &mut schema);
    let users = schema.table("users").unwrap();
    assert!(users.column("name").is_none());
    assert!(users.column("full_name").is_some());
}

/// Adding a check constraint to existing data goes through a shadow
/// column scrubbed by the up expression.
#[test]
fn test_check_constraint_migration() {
    let migration = Migration::from_json(
        r#"{
            "name": "04_age_positive",
            "operations": [{
                "kind": "create_constraint",
                "table": "people",
                "name": "age_positive",
                "type": "check",
                "columns": ["age"],
                "check": "age > 0",
                "up": {"age": "GREATEST(age, 1)"}
            }]
        }"#,
    )
    .unwrap();

    let mut people = Table::new("people");
    people.add_column(Column::new("age", "integer")).unwrap();
    let mut schema = Schema::new("public");
    schema.add_table(people).unwrap();

    apply(&migration, &mut schema);
    assert!(
        schema
            .table("people")
            .unwrap()
            .check_constraints
            .contains_key("age_positive")
    );
}

/// Validation failures are collected per operation, not short-circuited.
#[test]
fn test_validation_reports_every_error() {
    let migration = Migration::from_json(
        r#"{
            "name": "05_bad",
            "operations": [
                {"kind": "drop_table", "name": "missing_one"},
                {"kind": "drop_table", "name": "missing_two"}
            ]
        }"#,
    )
    .unwrap();

    let schema = Schema::new("public");
    let failures: Vec<_> = migration
        .operations
        .iter()
        .filter(|op| op.as_operation().validate(&schema).is_err())
        .collect();
    assert_eq!(failures.len(), 2);
}

/// A multi-operation migration where later operations depend on earlier
/// ones.
#[test]
fn test_operations_compose_in_order() {
    let migration = Migration::from_json(
        r#"{
            "name": "06_compose",
            "operations": [
                {
                    "kind": "create_table",
                    "name": "orders",
                    "columns": [
                        {"name": "id", "type": "integer", "pk": true, "nullable": false},
                        {"name": "user_id", "type": "integer", "nullable": false}
                    ]
                },
                {
                    "kind": "create_index",
                    "table": "orders",
                    "name": "orders_user_id_idx",
                    "columns": ["user_id"]
                },
                {
                    "kind": "rename_table",
                    "from": "orders",
                    "to": "purchases"
                }
            ]
        }"#,
    )
    .unwrap();

    let mut schema = users_schema();
    apply(&migration, &mut schema);

    assert!(schema.table("orders").is_none());
    let purchases = schema.table("purchases").unwrap();
    assert!(purchases.indexes.contains_key("orders_user_id_idx"));
}

/// Operation documents round-trip byte-for-byte through serde.
#[test]
fn test_document_round_trip() {
    let json = r#"{
        "name": "07_raw",
        "operations": [
            {"kind": "raw_sql", "up": "CREATE SEQUENCE s", "down": "DROP SEQUENCE s"},
            {"kind": "drop_index", "name": "users_email_idx"},
            {"kind": "rename_constraint", "table": "users", "from": "a", "to": "b"}
        ]
    }"#;

    let migration = Migration::from_json(json).unwrap();
    let reparsed = Migration::from_json(&migration.to_json().unwrap()).unwrap();
    assert_eq!(reparsed.operations.len(), 3);
    assert!(matches!(reparsed.operations[0], Op::RawSql(_)));
    assert!(matches!(reparsed.operations[1], Op::DropIndex(_)));
    assert!(matches!(reparsed.operations[2], Op::RenameConstraint(_)));
}
