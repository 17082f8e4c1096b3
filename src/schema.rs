//! Relational schema: core provenance tables and per-model result tables.

use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{query::Query, Row, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::ProvenanceError;
use crate::model::{
    validate_model, ColumnType, FieldValues, OutputId, OutputModel, Record, SqlValue,
    TaskInstanceId,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS parameter (
    pk INTEGER PRIMARY KEY,
    parameter_name TEXT NOT NULL,
    parameter_value TEXT NOT NULL,
    UNIQUE (parameter_name, parameter_value)
);

CREATE TABLE IF NOT EXISTS output_interface (
    pk INTEGER PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_instance (
    pk INTEGER PRIMARY KEY,
    dag_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    run_id TEXT,
    output_pk INTEGER REFERENCES output_interface(pk),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_instance_parameter (
    ti_pk INTEGER NOT NULL REFERENCES task_instance(pk),
    parameter_pk INTEGER NOT NULL REFERENCES parameter(pk),
    PRIMARY KEY (ti_pk, parameter_pk)
);

CREATE INDEX IF NOT EXISTS idx_task_instance_identity ON task_instance(dag_id, task_id, run_id);
CREATE INDEX IF NOT EXISTS idx_task_instance_parameter_parameter ON task_instance_parameter(parameter_pk)
"#;

/// Create the core provenance tables if they do not exist.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), ProvenanceError> {
    for statement in SCHEMA.split(';') {
        let trimmed = statement.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }
    Ok(())
}

/// Create the result table for `M` if it does not exist.
pub async fn ensure_table<M: OutputModel>(pool: &SqlitePool) -> Result<(), ProvenanceError> {
    let ddl = create_table_sql::<M>()?;
    sqlx::query(&ddl).execute(pool).await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_ti_pk ON {table}(ti_pk)",
        table = M::table()
    ))
    .execute(pool)
    .await?;

    debug!(table = M::table(), "Ensured result table");
    Ok(())
}

pub(crate) fn create_table_sql<M: OutputModel>() -> Result<String, ProvenanceError> {
    let columns = validate_model::<M>()?;

    let mut defs = vec![
        "pk INTEGER PRIMARY KEY".to_string(),
        "ti_pk INTEGER REFERENCES task_instance(pk)".to_string(),
        "output_pk INTEGER REFERENCES output_interface(pk)".to_string(),
    ];
    for column in &columns {
        let mut def = format!("{} {}", column.name, column.kind.sql());
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        if column.unique {
            def.push_str(" UNIQUE");
        }
        defs.push(def);
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        M::table(),
        defs.join(", ")
    ))
}

/// Build an INSERT for `rows` records of `M`, returning the generated pks.
pub(crate) fn insert_sql<M: OutputModel>(rows: usize) -> Result<String, ProvenanceError> {
    let columns = validate_model::<M>()?;

    let mut names = vec!["ti_pk", "output_pk"];
    names.extend(columns.iter().map(|c| c.name));

    let placeholders = format!("({})", vec!["?"; names.len()].join(", "));
    let values = vec![placeholders; rows].join(", ");

    Ok(format!(
        "INSERT INTO {} ({}) VALUES {} RETURNING pk",
        M::table(),
        names.join(", "),
        values
    ))
}

/// Number of bound values one record of `M` needs.
pub(crate) fn binds_per_record<M: OutputModel>() -> usize {
    M::columns().len() + 2
}

/// SELECT list covering every column of `M`'s table.
pub(crate) fn select_columns<M: OutputModel>() -> Result<String, ProvenanceError> {
    let columns = validate_model::<M>()?;
    let mut names = vec!["pk", "ti_pk", "output_pk"];
    names.extend(columns.iter().map(|c| c.name));
    Ok(names.join(", "))
}

pub(crate) fn bind_record<'q, M: OutputModel>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    record: &Record<M>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let mut query = query
        .bind(record.ti_pk.map(|id| id.0))
        .bind(record.output_pk.map(|id| id.0));
    for value in record.fields.values() {
        query = bind_value(query, value);
    }
    query
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<i64>),
        SqlValue::Integer(v) => query.bind(v),
        SqlValue::Real(v) => query.bind(v),
        SqlValue::Text(v) => query.bind(v),
        SqlValue::Boolean(v) => query.bind(v),
    }
}

/// Decode a row selected with `select_columns::<M>()`.
pub(crate) fn decode_record<M: OutputModel>(row: &SqliteRow) -> Result<Record<M>, ProvenanceError> {
    let mut values = FieldValues::new();
    for column in M::columns() {
        let value: SqlValue = match column.kind {
            ColumnType::Integer => row.try_get::<Option<i64>, _>(column.name)?.into(),
            ColumnType::Real => row.try_get::<Option<f64>, _>(column.name)?.into(),
            ColumnType::Text => row.try_get::<Option<String>, _>(column.name)?.into(),
            ColumnType::Boolean => row.try_get::<Option<bool>, _>(column.name)?.into(),
        };
        values.insert(column.name, value);
    }

    Ok(Record {
        pk: Some(row.try_get("pk")?),
        ti_pk: row.try_get::<Option<i64>, _>("ti_pk")?.map(TaskInstanceId),
        output_pk: row.try_get::<Option<i64>, _>("output_pk")?.map(OutputId),
        fields: M::from_values(&values)?,
    })
}
