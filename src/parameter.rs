//! Content-addressed storage of parameter name/value pairs.

use sqlx::SqlitePool;
use tracing::{debug, error};

use crate::error::{is_unique_violation, ProvenanceError};
use crate::model::ParameterId;
use crate::value::ParamValue;

/// SQLite-backed parameter store.
///
/// At most one row exists per (name, serialized value); rows are never
/// mutated or deleted.
#[derive(Clone)]
pub struct ParameterStore {
    pool: SqlitePool,
}

impl ParameterStore {
    /// Create a new ParameterStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the pk for a name/value pair, creating the row if needed.
    ///
    /// Returns the pk and whether this call created the row. A concurrent
    /// insert of the same pair is resolved by re-reading the winner's row.
    pub async fn get_or_create(
        &self,
        name: &str,
        value: &ParamValue,
    ) -> Result<(ParameterId, bool), ProvenanceError> {
        let serialized = value.canonical()?;

        if let Some(id) = self.lookup_serialized(name, &serialized).await? {
            return Ok((id, false));
        }

        match self.insert(name, &serialized).await {
            Ok(id) => {
                debug!(name, value = %serialized, pk = id.0, "Created parameter");
                Ok((id, true))
            }
            Err(e) if is_unique_violation(&e) => {
                debug!(name, value = %serialized, "Lost parameter insert race, re-reading");
                match self.lookup_serialized(name, &serialized).await? {
                    Some(id) => Ok((id, false)),
                    None => {
                        error!(name, value = %serialized, "Cannot create or retrieve parameter");
                        Err(e.into())
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Find the pk for a name/value pair without creating it.
    pub async fn lookup(
        &self,
        name: &str,
        value: &ParamValue,
    ) -> Result<Option<ParameterId>, ProvenanceError> {
        let serialized = value.canonical()?;
        self.lookup_serialized(name, &serialized).await
    }

    pub(crate) async fn lookup_serialized(
        &self,
        name: &str,
        serialized: &str,
    ) -> Result<Option<ParameterId>, ProvenanceError> {
        let pk: Option<i64> = sqlx::query_scalar(
            "SELECT pk FROM parameter WHERE parameter_name = ? AND parameter_value = ?",
        )
        .bind(name)
        .bind(serialized)
        .fetch_optional(&self.pool)
        .await?;

        Ok(pk.map(ParameterId))
    }

    async fn insert(&self, name: &str, serialized: &str) -> Result<ParameterId, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let pk: i64 = sqlx::query_scalar(
            "INSERT INTO parameter (parameter_name, parameter_value) VALUES (?, ?) RETURNING pk",
        )
        .bind(name)
        .bind(serialized)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(ParameterId(pk))
    }
}
