//! Result records and the description of the tables that hold them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProvenanceError;

/// Primary key of a row in the parameter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterId(pub i64);

/// Primary key of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskInstanceId(pub i64);

/// Primary key of an output interface row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputId(pub i64);

/// SQL storage class of a task-specific column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
}

impl ColumnType {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }
}

/// A task-specific column of a result table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnType,
    pub nullable: bool,
    pub unique: bool,
}

impl Column {
    fn new(name: &'static str, kind: ColumnType) -> Self {
        Self {
            name,
            kind,
            nullable: false,
            unique: false,
        }
    }

    pub fn integer(name: &'static str) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn real(name: &'static str) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn text(name: &'static str) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn boolean(name: &'static str) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    /// Allow NULL in this column.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Add a UNIQUE constraint to this column.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// A value bound to, or read from, a task-specific column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Column values of a stored row, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldValues(BTreeMap<String, SqlValue>);

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: SqlValue) {
        self.0.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.0.get(name)
    }

    pub fn i64(&self, name: &str) -> Result<i64, ProvenanceError> {
        match self.required(name)? {
            SqlValue::Integer(v) => Ok(*v),
            other => Err(mismatch(name, "integer", other)),
        }
    }

    pub fn f64(&self, name: &str) -> Result<f64, ProvenanceError> {
        match self.required(name)? {
            SqlValue::Real(v) => Ok(*v),
            SqlValue::Integer(v) => Ok(*v as f64),
            other => Err(mismatch(name, "real", other)),
        }
    }

    pub fn text(&self, name: &str) -> Result<String, ProvenanceError> {
        match self.required(name)? {
            SqlValue::Text(v) => Ok(v.clone()),
            other => Err(mismatch(name, "text", other)),
        }
    }

    pub fn bool(&self, name: &str) -> Result<bool, ProvenanceError> {
        match self.required(name)? {
            SqlValue::Boolean(v) => Ok(*v),
            SqlValue::Integer(v) => Ok(*v != 0),
            other => Err(mismatch(name, "boolean", other)),
        }
    }

    /// Read an optional column; NULL maps to `None`.
    pub fn optional<T>(
        &self,
        name: &str,
        read: impl Fn(&Self, &str) -> Result<T, ProvenanceError>,
    ) -> Result<Option<T>, ProvenanceError> {
        match self.get(name) {
            None | Some(SqlValue::Null) => Ok(None),
            Some(_) => read(self, name).map(Some),
        }
    }

    fn required(&self, name: &str) -> Result<&SqlValue, ProvenanceError> {
        match self.0.get(name) {
            None | Some(SqlValue::Null) => Err(ProvenanceError::Deserialization(format!(
                "column '{name}' is missing or NULL"
            ))),
            Some(value) => Ok(value),
        }
    }
}

fn mismatch(name: &str, expected: &str, found: &SqlValue) -> ProvenanceError {
    ProvenanceError::Deserialization(format!(
        "column '{name}': expected {expected}, found {found:?}"
    ))
}

/// The task-specific part of a result record.
///
/// Each implementor owns one result table. The crate adds the `pk`, `ti_pk`
/// and `output_pk` columns; `columns` lists only the task-specific ones, in
/// the same order `values` returns them.
pub trait OutputModel: Clone + Send + Sync + 'static {
    /// Name of the result table.
    fn table() -> &'static str;

    /// Task-specific columns.
    fn columns() -> Vec<Column>;

    /// Values for `columns`, in order.
    fn values(&self) -> Vec<SqlValue>;

    /// Rebuild the model from a stored row.
    fn from_values(values: &FieldValues) -> Result<Self, ProvenanceError>;
}

/// A result row: generated identifiers plus the task-specific fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<M> {
    /// Generated primary key; `None` until the row is persisted.
    pub pk: Option<i64>,
    pub ti_pk: Option<TaskInstanceId>,
    pub output_pk: Option<OutputId>,
    pub fields: M,
}

impl<M> Record<M> {
    /// A fresh, unpersisted record that belongs to no task instance.
    pub fn new(fields: M) -> Self {
        Self {
            pk: None,
            ti_pk: None,
            output_pk: None,
            fields,
        }
    }

    /// Attribute the record to a task instance.
    pub fn for_task(mut self, ti_pk: TaskInstanceId) -> Self {
        self.ti_pk = Some(ti_pk);
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.pk.is_some()
    }
}

/// Check that a table or column name is a plain SQL identifier.
///
/// Names are interpolated into DDL and DML, so anything else is rejected.
pub(crate) fn validate_identifier(name: &str) -> Result<(), ProvenanceError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ProvenanceError::Schema(format!(
            "'{name}' is not a valid identifier"
        )))
    }
}

/// Column names reserved for the identifiers every result table carries.
pub(crate) const RESERVED_COLUMNS: [&str; 3] = ["pk", "ti_pk", "output_pk"];

/// Validate a model's table and column names.
pub(crate) fn validate_model<M: OutputModel>() -> Result<Vec<Column>, ProvenanceError> {
    validate_identifier(M::table())?;
    let columns = M::columns();
    for column in &columns {
        validate_identifier(column.name)?;
        if RESERVED_COLUMNS.contains(&column.name) {
            return Err(ProvenanceError::Schema(format!(
                "column '{}' of '{}' is reserved",
                column.name,
                M::table()
            )));
        }
    }
    Ok(columns)
}
