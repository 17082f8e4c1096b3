//! Binding task instances to their outputs, with history retained.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::error::ProvenanceError;
use crate::model::{OutputId, OutputModel, Record, TaskInstanceId};
use crate::schema::{bind_record, decode_record, ensure_table, insert_sql, select_columns};

/// SQLite-backed output linker.
///
/// Every output gets a fresh `output_interface` row. Superseded result rows
/// are kept; `task_instance.output_pk` points at the current one.
#[derive(Clone)]
pub struct OutputLinker {
    pool: SqlitePool,
}

impl OutputLinker {
    /// Create a new OutputLinker.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record `fields` as the new output of a task instance.
    ///
    /// Writes happen in order: interface, result row, then the instance
    /// link. A failure before the link leaves an unlinked result row, which
    /// `repair_link` can adopt later.
    pub async fn create_output<M: OutputModel>(
        &self,
        instance: impl Into<TaskInstanceId>,
        fields: M,
    ) -> Result<Record<M>, ProvenanceError> {
        let ti = instance.into();
        self.resolve(ti).await?;
        ensure_table::<M>(&self.pool).await?;

        let output_pk: i64 = sqlx::query_scalar(
            "INSERT INTO output_interface (created_at) VALUES (?) RETURNING pk",
        )
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        let mut record = Record::new(fields).for_task(ti);
        record.output_pk = Some(OutputId(output_pk));

        let sql = insert_sql::<M>(1)?;
        let row = bind_record(sqlx::query(&sql), &record)
            .fetch_one(&self.pool)
            .await?;
        let pk: i64 = row.try_get(0)?;
        record.pk = Some(pk);

        self.link(ti, OutputId(output_pk)).await?;

        info!(
            table = M::table(),
            ti_pk = ti.0,
            output_pk,
            pk,
            "Created task output"
        );
        Ok(record)
    }

    /// The record the instance currently points at, if any.
    pub async fn current<M: OutputModel>(
        &self,
        instance: impl Into<TaskInstanceId>,
    ) -> Result<Option<Record<M>>, ProvenanceError> {
        let ti = instance.into();
        ensure_table::<M>(&self.pool).await?;

        let sql = format!(
            "SELECT {} FROM {} WHERE ti_pk = ? AND output_pk = \
             (SELECT output_pk FROM task_instance WHERE pk = ?)",
            select_columns::<M>()?,
            M::table()
        );
        let row = sqlx::query(&sql)
            .bind(ti.0)
            .bind(ti.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_record::<M>).transpose()
    }

    /// Every record ever written for the instance, oldest first.
    pub async fn history<M: OutputModel>(
        &self,
        instance: impl Into<TaskInstanceId>,
    ) -> Result<Vec<Record<M>>, ProvenanceError> {
        let ti = instance.into();
        ensure_table::<M>(&self.pool).await?;

        let sql = format!(
            "SELECT {} FROM {} WHERE ti_pk = ? ORDER BY pk",
            select_columns::<M>()?,
            M::table()
        );
        let rows = sqlx::query(&sql).bind(ti.0).fetch_all(&self.pool).await?;

        rows.iter().map(decode_record::<M>).collect()
    }

    /// Point the instance at its newest result row in `M`'s table when that
    /// row is newer than the current link.
    ///
    /// Returns the adopted output, or `None` when the link was already
    /// current.
    pub async fn repair_link<M: OutputModel>(
        &self,
        instance: impl Into<TaskInstanceId>,
    ) -> Result<Option<OutputId>, ProvenanceError> {
        let ti = instance.into();
        let current = self.resolve(ti).await?;
        ensure_table::<M>(&self.pool).await?;

        let newest: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(output_pk) FROM {} WHERE ti_pk = ?",
            M::table()
        ))
        .bind(ti.0)
        .fetch_one(&self.pool)
        .await?;

        match newest {
            Some(output_pk) if current.map_or(true, |c| output_pk > c.0) => {
                self.link(ti, OutputId(output_pk)).await?;
                warn!(
                    table = M::table(),
                    ti_pk = ti.0,
                    output_pk,
                    "Re-linked orphaned task output"
                );
                Ok(Some(OutputId(output_pk)))
            }
            _ => Ok(None),
        }
    }

    /// Returns the instance's current output pk, or NotFound.
    async fn resolve(&self, ti: TaskInstanceId) -> Result<Option<OutputId>, ProvenanceError> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT output_pk FROM task_instance WHERE pk = ?")
                .bind(ti.0)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((output_pk,)) => Ok(output_pk.map(OutputId)),
            None => Err(ProvenanceError::NotFound {
                entity: "task_instance",
                pk: ti.0,
            }),
        }
    }

    async fn link(&self, ti: TaskInstanceId, output: OutputId) -> Result<(), ProvenanceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE task_instance SET output_pk = ? WHERE pk = ?")
            .bind(output.0)
            .bind(ti.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
