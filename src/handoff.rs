//! Passing task instance primary keys between processes.
//!
//! A set of pks travels either inline or as a path to a JSON file holding
//! (possibly nested) lists of integers. Decoding accepts every shape a
//! scheduler is likely to hand back and flattens on request.

use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ProvenanceError;

/// A primary key payload as received from a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum PkInput {
    Int(i64),
    /// Coerced to an integer with a warning.
    Float(f64),
    List(Vec<PkInput>),
    /// A path to a JSON file, or a JSON-like literal.
    Text(String),
}

impl From<i64> for PkInput {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for PkInput {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for PkInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<&Path> for PkInput {
    fn from(value: &Path) -> Self {
        Self::Text(value.to_string_lossy().into_owned())
    }
}

impl<T: Into<PkInput>> From<Vec<T>> for PkInput {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl TryFrom<serde_json::Value> for PkInput {
    type Error = ProvenanceError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Self::Int(i)),
                None => n.as_f64().map(Self::Float).ok_or_else(|| {
                    ProvenanceError::Deserialization(format!("cannot deserialize primary key {n}"))
                }),
            },
            Value::Array(items) => items
                .into_iter()
                .map(Self::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Value::String(s) => Ok(Self::Text(s)),
            other => Err(ProvenanceError::Deserialization(format!(
                "cannot deserialize primary key {other}"
            ))),
        }
    }
}

/// Decoded primary keys, keeping the nesting of the input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PkTree {
    Pk(i64),
    List(Vec<PkTree>),
}

impl PkTree {
    /// All pks in depth-first order.
    pub fn flatten(&self) -> Vec<i64> {
        let mut out = Vec::new();
        self.collect_into(&mut out);
        out
    }

    fn collect_into(&self, out: &mut Vec<i64>) {
        match self {
            Self::Pk(pk) => out.push(*pk),
            Self::List(items) => items.iter().for_each(|item| item.collect_into(out)),
        }
    }
}

/// Nesting allowed through lists, literals and referenced files.
const MAX_DEPTH: usize = 64;

/// Floats at or beyond this magnitude do not fit in an `i64`.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// Decode a primary key payload, keeping its nesting.
pub fn deserialize_pks(input: &PkInput) -> Result<PkTree, ProvenanceError> {
    decode(input, &mut Vec::new(), 0)
}

/// Decode a primary key payload into a flat list.
pub fn deserialize_flat_pks(input: &PkInput) -> Result<Vec<i64>, ProvenanceError> {
    Ok(deserialize_pks(input)?.flatten())
}

/// `open` holds the files currently being read, outermost first.
fn decode(
    input: &PkInput,
    open: &mut Vec<PathBuf>,
    depth: usize,
) -> Result<PkTree, ProvenanceError> {
    if depth > MAX_DEPTH {
        return Err(ProvenanceError::Deserialization(format!(
            "primary key payload nested deeper than {MAX_DEPTH} levels"
        )));
    }

    match input {
        PkInput::Int(pk) => Ok(PkTree::Pk(*pk)),
        PkInput::Float(value) => {
            let truncated = value.trunc();
            if !truncated.is_finite() || truncated >= I64_BOUND || truncated < -I64_BOUND {
                return Err(ProvenanceError::Deserialization(format!(
                    "cannot deserialize primary key {value}"
                )));
            }
            warn!(value, "Forcing primary key input to integer");
            Ok(PkTree::Pk(truncated as i64))
        }
        PkInput::List(items) => items
            .iter()
            .map(|item| decode(item, open, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(PkTree::List),
        PkInput::Text(text) => {
            let path = Path::new(text);
            if !path.is_file() {
                let literal = parse_literal(text)?;
                return decode(&PkInput::try_from(literal)?, open, depth + 1);
            }

            let path = path.canonicalize()?;
            if open.contains(&path) {
                return Err(ProvenanceError::Deserialization(format!(
                    "primary key file {} refers back to itself",
                    path.display()
                )));
            }
            let contents = read_file(&path)?;
            open.push(path);
            let decoded =
                PkInput::try_from(contents).and_then(|inner| decode(&inner, open, depth + 1));
            open.pop();
            decoded
        }
    }
}

fn read_file(path: &Path) -> Result<serde_json::Value, ProvenanceError> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| {
        ProvenanceError::Deserialization(format!(
            "cannot deserialize primary keys in {}: {e}",
            path.display()
        ))
    })
}

fn parse_literal(text: &str) -> Result<serde_json::Value, ProvenanceError> {
    // Literals written by other tools often use single quotes.
    serde_json::from_str(&text.replace('\'', "\"")).map_err(|e| {
        ProvenanceError::Deserialization(format!("cannot deserialize primary key {text:?}: {e}"))
    })
}

/// Where and how to name the temporary file holding serialized pks.
#[derive(Debug, Clone, Default)]
pub struct TempPathOptions {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    /// Defaults to the system temporary directory.
    pub dir: Option<PathBuf>,
}

impl TempPathOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    pub fn suffix(mut self, suffix: &str) -> Self {
        self.suffix = Some(suffix.to_string());
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }
}

/// Write pks as JSON to a new temporary file and return its path.
///
/// The file is kept; removing it is up to whoever consumes the path.
pub fn serialize_pks_to_path<T: Serialize + ?Sized>(
    pks: &T,
    options: &TempPathOptions,
) -> Result<PathBuf, ProvenanceError> {
    let mut builder = tempfile::Builder::new();
    if let Some(prefix) = &options.prefix {
        builder.prefix(prefix);
    }
    if let Some(suffix) = &options.suffix {
        builder.suffix(suffix);
    }

    let mut file = match &options.dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };

    let json = serde_json::to_string(pks)
        .map_err(|e| ProvenanceError::Serialization(e.to_string()))?;
    file.write_all(json.as_bytes())?;
    file.flush()?;

    let (_, path) = file.keep().map_err(|e| ProvenanceError::Io(e.error))?;
    Ok(path)
}

/// Task instance pks ready to hand to the next task.
#[derive(Debug, Clone, PartialEq)]
pub enum PkHandoff {
    Inline(Vec<i64>),
    Path(PathBuf),
}

impl PkHandoff {
    /// Hand pks over inline when asked to or when there are none; otherwise
    /// serialize them to a temporary file.
    pub fn new(
        pks: Vec<i64>,
        inline: bool,
        options: &TempPathOptions,
    ) -> Result<Self, ProvenanceError> {
        if pks.is_empty() || inline {
            info!(count = pks.len(), "Returning pks inline");
            return Ok(Self::Inline(pks));
        }

        let path = serialize_pks_to_path(&pks, options)?;
        info!(count = pks.len(), path = %path.display(), "Serialized pks to path");
        Ok(Self::Path(path))
    }

    /// The payload to give the receiving side, for `deserialize_pks`.
    pub fn to_input(&self) -> PkInput {
        match self {
            Self::Inline(pks) => PkInput::from(pks.clone()),
            Self::Path(path) => PkInput::from(path.as_path()),
        }
    }
}
