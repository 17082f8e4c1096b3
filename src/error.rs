//! Error types shared by every component.

use thiserror::Error;

/// Error returned by provenance and persistence operations.
#[derive(Error, Debug)]
pub enum ProvenanceError {
    /// A parameter value has no canonical serialized form.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A write conflicted with a uniqueness or content constraint.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Any other storage fault.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A referenced row does not exist.
    #[error("{entity} not found: pk={pk}")]
    NotFound { entity: &'static str, pk: i64 },

    /// A primary key payload could not be decoded.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The registry found more than one instance for a single identity.
    #[error("data integrity fault: {0}")]
    DataIntegrityFault(String),

    /// No run id was given and the identity exists in more than one run.
    #[error("ambiguous run: {0}")]
    AmbiguousRun(String),

    /// An output model declared an unusable table or column.
    #[error("schema error: {0}")]
    Schema(String),

    /// The task's computation failed while producing a record.
    #[error("computation '{task}' failed: {source}")]
    Computation {
        task: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvenanceError {
    /// Returns true for faults raised while writing to the store.
    pub fn is_write_fault(&self) -> bool {
        matches!(self, Self::Integrity(_) | Self::Persistence(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for ProvenanceError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        match &err {
            sqlx::Error::Database(db)
                if matches!(
                    db.kind(),
                    ErrorKind::UniqueViolation
                        | ErrorKind::ForeignKeyViolation
                        | ErrorKind::NotNullViolation
                        | ErrorKind::CheckViolation
                ) =>
            {
                Self::Integrity(db.message().to_string())
            }
            _ => Self::Persistence(err.to_string()),
        }
    }
}

/// Returns true when the error is a uniqueness conflict raised by the database.
#[cfg(feature = "sqlite")]
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
