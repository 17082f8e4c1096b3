//! SQLite batch writers.

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::debug;

use super::{BatchWriter, WriteSummary};
use crate::error::ProvenanceError;
use crate::model::{OutputModel, Record};
use crate::schema::{binds_per_record, bind_record, ensure_table, insert_sql};

/// Bound-value limit assumed for a single statement.
const MAX_BIND_PARAMS: usize = 999;

/// Result tables this writer has already created or confirmed.
#[derive(Default)]
struct KnownTables(Mutex<HashSet<&'static str>>);

impl KnownTables {
    async fn ensure<M: OutputModel>(&self, pool: &SqlitePool) -> Result<(), ProvenanceError> {
        let mut known = self.0.lock().await;
        if !known.contains(M::table()) {
            ensure_table::<M>(pool).await?;
            known.insert(M::table());
        }
        Ok(())
    }
}

/// Inserts rows one at a time inside each chunk's transaction and reads
/// back every generated pk.
///
/// Slower than a multi-row insert, but every record gets its pk on any
/// backend.
pub struct RowByRowWriter {
    pool: SqlitePool,
    tables: KnownTables,
}

impl RowByRowWriter {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            tables: KnownTables::default(),
        }
    }
}

#[async_trait]
impl BatchWriter for RowByRowWriter {
    async fn write<M: OutputModel>(
        &self,
        records: &mut [Record<M>],
        batch_size: usize,
    ) -> Result<WriteSummary, ProvenanceError> {
        let mut summary = WriteSummary::default();
        if records.is_empty() {
            return Ok(summary);
        }
        self.tables.ensure::<M>(&self.pool).await?;

        let sql = insert_sql::<M>(1)?;
        for chunk in records.chunks_mut(batch_size.max(1)) {
            let mut tx = self.pool.begin().await?;
            let mut pks = Vec::with_capacity(chunk.len());
            for record in chunk.iter() {
                let row = bind_record(sqlx::query(&sql), record)
                    .fetch_one(&mut *tx)
                    .await?;
                pks.push(row.try_get::<i64, _>(0)?);
            }
            tx.commit().await?;

            for (record, pk) in chunk.iter_mut().zip(pks) {
                record.pk = Some(pk);
            }
            summary.chunks += 1;
            summary.rows += chunk.len();
            debug!(table = M::table(), rows = chunk.len(), "Committed chunk");
        }

        Ok(summary)
    }
}

/// Inserts each chunk with multi-row `INSERT ... RETURNING` statements.
///
/// RETURNING rows come back in no guaranteed order. Rowids within one
/// statement are assigned in VALUES order, so each statement's pks are
/// sorted before being matched to its records.
pub struct ReturningWriter {
    pool: SqlitePool,
    tables: KnownTables,
}

impl ReturningWriter {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            tables: KnownTables::default(),
        }
    }
}

#[async_trait]
impl BatchWriter for ReturningWriter {
    async fn write<M: OutputModel>(
        &self,
        records: &mut [Record<M>],
        batch_size: usize,
    ) -> Result<WriteSummary, ProvenanceError> {
        let mut summary = WriteSummary::default();
        if records.is_empty() {
            return Ok(summary);
        }
        self.tables.ensure::<M>(&self.pool).await?;

        let rows_per_statement = (MAX_BIND_PARAMS / binds_per_record::<M>()).max(1);
        for chunk in records.chunks_mut(batch_size.max(1)) {
            let mut tx = self.pool.begin().await?;
            let mut pks = Vec::with_capacity(chunk.len());
            for part in chunk.chunks(rows_per_statement) {
                let sql = insert_sql::<M>(part.len())?;
                let mut query = sqlx::query(&sql);
                for record in part {
                    query = bind_record(query, record);
                }
                let rows = query.fetch_all(&mut *tx).await?;
                if rows.len() != part.len() {
                    return Err(ProvenanceError::Persistence(format!(
                        "inserted {} rows into {} but {} pks were returned",
                        part.len(),
                        M::table(),
                        rows.len()
                    )));
                }
                let mut returned = rows
                    .iter()
                    .map(|row| row.try_get::<i64, _>(0))
                    .collect::<Result<Vec<_>, _>>()?;
                returned.sort_unstable();
                pks.extend(returned);
            }
            tx.commit().await?;

            for (record, pk) in chunk.iter_mut().zip(pks) {
                record.pk = Some(pk);
            }
            summary.chunks += 1;
            summary.rows += chunk.len();
            debug!(table = M::table(), rows = chunk.len(), "Committed chunk");
        }

        Ok(summary)
    }
}

/// How generated pks are obtained from a batch insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// Insert and read back row by row. The default for SQLite.
    #[default]
    RowByRow,
    /// Multi-row inserts returning pks in order.
    Returning,
}

/// A batch writer chosen by strategy; callers see one type either way.
pub enum SqlBatchWriter {
    RowByRow(RowByRowWriter),
    Returning(ReturningWriter),
}

impl SqlBatchWriter {
    pub fn new(pool: SqlitePool, strategy: WriteStrategy) -> Self {
        match strategy {
            WriteStrategy::RowByRow => Self::RowByRow(RowByRowWriter::new(pool)),
            WriteStrategy::Returning => Self::Returning(ReturningWriter::new(pool)),
        }
    }

    /// The default writer for a SQLite pool.
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self::new(pool, WriteStrategy::default())
    }

    pub fn strategy(&self) -> WriteStrategy {
        match self {
            Self::RowByRow(_) => WriteStrategy::RowByRow,
            Self::Returning(_) => WriteStrategy::Returning,
        }
    }
}

#[async_trait]
impl BatchWriter for SqlBatchWriter {
    async fn write<M: OutputModel>(
        &self,
        records: &mut [Record<M>],
        batch_size: usize,
    ) -> Result<WriteSummary, ProvenanceError> {
        match self {
            Self::RowByRow(writer) => writer.write(records, batch_size).await,
            Self::Returning(writer) => writer.write(records, batch_size).await,
        }
    }
}
