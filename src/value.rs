//! Free-form task parameters and their canonical serialized form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProvenanceError;

/// A single parameter value.
///
/// Parameters are validated only by whether they have a canonical
/// serialized form, never against a fixed schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// Serialize the value to the text stored in the parameter table.
    ///
    /// Text passes through unchanged. Everything else becomes compact JSON
    /// with sorted map keys, so equal values always produce equal text.
    pub fn canonical(&self) -> Result<String, ProvenanceError> {
        match self {
            Self::Text(s) => Ok(s.clone()),
            other => {
                other.check_finite()?;
                serde_json::to_string(other)
                    .map_err(|e| ProvenanceError::Serialization(e.to_string()))
            }
        }
    }

    // serde_json writes NaN and infinities as `null`, which would collide
    // with a real null.
    fn check_finite(&self) -> Result<(), ProvenanceError> {
        match self {
            Self::Float(f) if !f.is_finite() => Err(ProvenanceError::Serialization(format!(
                "non-finite float {f} has no canonical form"
            ))),
            Self::List(items) => items.iter().try_for_each(Self::check_finite),
            Self::Map(entries) => entries.values().try_for_each(Self::check_finite),
            _ => Ok(()),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for ParamValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Text(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

/// An ordered mapping of parameter names to values.
///
/// Key order never affects identity: two maps with the same pairs are equal
/// however they were built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, ParamValue>);

impl Parameters {
    /// Create an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, replacing any previous value for the name.
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert a parameter, returning the previous value for the name.
    pub fn insert(&mut self, name: &str, value: impl Into<ParamValue>) -> Option<ParamValue> {
        self.0.insert(name.to_string(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge `other` into a copy of `self`; keys in `other` win.
    pub fn merged_with(&self, other: &Parameters) -> Parameters {
        let mut merged = self.clone();
        for (name, value) in other.iter() {
            merged.insert(name, value.clone());
        }
        merged
    }

    /// Serialize every value, keyed by name.
    pub fn canonical(&self) -> Result<BTreeMap<String, String>, ProvenanceError> {
        self.0
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.canonical()?)))
            .collect()
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for Parameters {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
