//! Task instance identity: {dag id, task id, run id, exact parameter set}.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use crate::error::ProvenanceError;
use crate::model::{OutputId, ParameterId, TaskInstanceId};
use crate::parameter::ParameterStore;
use crate::value::{ParamValue, Parameters};

/// A registered task invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInstance {
    pub id: TaskInstanceId,
    pub dag_id: String,
    pub task_id: String,
    pub run_id: Option<String>,
    /// The current output, if any has been recorded.
    pub output_id: Option<OutputId>,
    pub created_at: DateTime<Utc>,
}

impl From<&TaskInstance> for TaskInstanceId {
    fn from(instance: &TaskInstance) -> Self {
        instance.id
    }
}

type TaskInstanceRow = (i64, String, String, Option<String>, Option<i64>, String);

const SELECT_INSTANCE: &str =
    "SELECT ti.pk, ti.dag_id, ti.task_id, ti.run_id, ti.output_pk, ti.created_at FROM task_instance ti";

fn into_instance(row: TaskInstanceRow) -> Result<TaskInstance, ProvenanceError> {
    let (pk, dag_id, task_id, run_id, output_pk, created_at) = row;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            ProvenanceError::Deserialization(format!(
                "task_instance {pk} has bad created_at '{created_at}': {e}"
            ))
        })?;

    Ok(TaskInstance {
        id: TaskInstanceId(pk),
        dag_id,
        task_id,
        run_id,
        output_id: output_pk.map(OutputId),
        created_at,
    })
}

/// SQLite-backed registry of task instances.
///
/// Lookups match the parameter set exactly: an instance with extra or
/// missing parameters is a different identity.
#[derive(Clone)]
pub struct TaskInstanceRegistry {
    pool: SqlitePool,
    parameters: ParameterStore,
}

impl TaskInstanceRegistry {
    /// Create a new TaskInstanceRegistry.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            parameters: ParameterStore::new(pool.clone()),
            pool,
        }
    }

    /// The parameter store this registry resolves parameters through.
    pub fn parameter_store(&self) -> &ParameterStore {
        &self.parameters
    }

    /// Find the instance with exactly this identity.
    ///
    /// A `run_id` of `None` matches any run; one match per run across
    /// several runs is `AmbiguousRun`. Any other multiple match is a
    /// `DataIntegrityFault`.
    pub async fn get(
        &self,
        dag_id: &str,
        task_id: &str,
        run_id: Option<&str>,
        parameters: &Parameters,
    ) -> Result<Option<TaskInstance>, ProvenanceError> {
        let mut required = Vec::with_capacity(parameters.len());
        for (name, serialized) in parameters.canonical()? {
            match self.parameters.lookup_serialized(&name, &serialized).await? {
                Some(id) => required.push(id.0),
                // An unknown pair means no instance can carry it.
                None => return Ok(None),
            }
        }

        let rows: Vec<TaskInstanceRow> = if required.is_empty() {
            let sql = format!(
                "{SELECT_INSTANCE} WHERE ti.dag_id = ? AND ti.task_id = ? \
                 AND (? IS NULL OR ti.run_id = ?) \
                 AND NOT EXISTS (SELECT 1 FROM task_instance_parameter tip WHERE tip.ti_pk = ti.pk)"
            );
            sqlx::query_as(&sql)
                .bind(dag_id)
                .bind(task_id)
                .bind(run_id)
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?
        } else {
            let placeholders = vec!["?"; required.len()].join(", ");
            let sql = format!(
                r#"{SELECT_INSTANCE}
                JOIN (
                    SELECT ti_pk FROM task_instance_parameter
                    GROUP BY ti_pk
                    HAVING COUNT(DISTINCT parameter_pk) = ?
                       AND SUM(CASE WHEN parameter_pk IN ({placeholders}) THEN 1 ELSE 0 END) = ?
                ) matched ON matched.ti_pk = ti.pk
                WHERE ti.dag_id = ? AND ti.task_id = ? AND (? IS NULL OR ti.run_id = ?)"#
            );
            let n = required.len() as i64;
            let mut query = sqlx::query_as::<_, TaskInstanceRow>(&sql).bind(n);
            for pk in &required {
                query = query.bind(*pk);
            }
            query
                .bind(n)
                .bind(dag_id)
                .bind(task_id)
                .bind(run_id)
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?
        };

        match rows.len() {
            0 => Ok(None),
            1 => rows.into_iter().next().map(into_instance).transpose(),
            n => {
                let pks: Vec<i64> = rows.iter().map(|r| r.0).collect();
                let runs: HashSet<Option<&str>> = rows.iter().map(|r| r.3.as_deref()).collect();
                if run_id.is_none() && runs.len() == n {
                    return Err(ProvenanceError::AmbiguousRun(format!(
                        "dag_id={dag_id} task_id={task_id} exists in {n} runs {runs:?}: {pks:?}"
                    )));
                }
                Err(ProvenanceError::DataIntegrityFault(format!(
                    "{n} task instances share identity dag_id={dag_id} task_id={task_id} \
                     run_id={run_id:?}: {pks:?}"
                )))
            }
        }
    }

    /// Return the instance with this identity, creating it if none exists.
    pub async fn get_or_create(
        &self,
        dag_id: &str,
        task_id: &str,
        run_id: Option<&str>,
        parameters: &Parameters,
    ) -> Result<TaskInstance, ProvenanceError> {
        if let Some(instance) = self.get(dag_id, task_id, run_id, parameters).await? {
            debug!(dag_id, task_id, pk = instance.id.0, "Found existing task instance");
            return Ok(instance);
        }
        self.create(dag_id, task_id, run_id, parameters).await
    }

    /// Create a new instance and link its parameters.
    ///
    /// The instance row and all of its parameter links commit together, so
    /// an instance is never visible with a partial parameter set.
    pub async fn create(
        &self,
        dag_id: &str,
        task_id: &str,
        run_id: Option<&str>,
        parameters: &Parameters,
    ) -> Result<TaskInstance, ProvenanceError> {
        let parameter_ids = self.resolve(parameters).await?;
        let created_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        let pk: i64 = sqlx::query_scalar(
            "INSERT INTO task_instance (dag_id, task_id, run_id, created_at) VALUES (?, ?, ?, ?) RETURNING pk",
        )
        .bind(dag_id)
        .bind(task_id)
        .bind(run_id)
        .bind(created_at.to_rfc3339())
        .fetch_one(&mut *tx)
        .await?;

        for (_, parameter_id) in &parameter_ids {
            link(&mut tx, TaskInstanceId(pk), *parameter_id).await?;
        }
        tx.commit().await?;

        info!(
            dag_id,
            task_id,
            run_id = run_id.unwrap_or_default(),
            pk,
            parameters = parameter_ids.len(),
            "Created task instance"
        );

        Ok(TaskInstance {
            id: TaskInstanceId(pk),
            dag_id: dag_id.to_string(),
            task_id: task_id.to_string(),
            run_id: run_id.map(str::to_string),
            output_id: None,
            created_at,
        })
    }

    /// Get or create one instance per item, in item order.
    ///
    /// Each item's parameters are merged with `shared`; shared keys win.
    pub async fn get_or_create_many<I>(
        &self,
        dag_id: &str,
        task_id: &str,
        run_id: Option<&str>,
        items: I,
        shared: &Parameters,
    ) -> Result<Vec<TaskInstanceId>, ProvenanceError>
    where
        I: IntoIterator<Item = Parameters>,
    {
        let mut ids = Vec::new();
        for item in items {
            let parameters = item.merged_with(shared);
            let instance = self
                .get_or_create(dag_id, task_id, run_id, &parameters)
                .await?;
            ids.push(instance.id);
        }

        info!(dag_id, task_id, count = ids.len(), "Resolved task instances");
        Ok(ids)
    }

    /// Fetch an instance by primary key.
    pub async fn fetch(
        &self,
        id: TaskInstanceId,
    ) -> Result<Option<TaskInstance>, ProvenanceError> {
        let row: Option<TaskInstanceRow> =
            sqlx::query_as(&format!("{SELECT_INSTANCE} WHERE ti.pk = ?"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(into_instance).transpose()
    }

    /// Fetch several instances; unknown pks are logged and skipped.
    pub async fn fetch_many(
        &self,
        ids: &[TaskInstanceId],
    ) -> Result<Vec<TaskInstance>, ProvenanceError> {
        let mut instances = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch(*id).await? {
                Some(instance) => instances.push(instance),
                None => warn!(pk = id.0, "No task instance found"),
            }
        }
        Ok(instances)
    }

    /// The effective parameter map of an instance, as serialized values.
    pub async fn parameters(
        &self,
        instance: impl Into<TaskInstanceId>,
    ) -> Result<BTreeMap<String, String>, ProvenanceError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT p.parameter_name, p.parameter_value
            FROM task_instance_parameter tip
            JOIN parameter p ON p.pk = tip.parameter_pk
            WHERE tip.ti_pk = ?
            "#,
        )
        .bind(instance.into().0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Link a parameter to an instance.
    ///
    /// Adding a pair the instance already has is a no-op. Adding a name the
    /// instance already has with another value is an integrity error; use
    /// `update_parameters` to replace values.
    pub async fn add_parameter(
        &self,
        instance: impl Into<TaskInstanceId>,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> Result<ParameterId, ProvenanceError> {
        let ti = instance.into();
        let (parameter_id, _) = self.parameters.get_or_create(name, &value.into()).await?;

        let mut tx = self.pool.begin().await?;
        ensure_exists(&mut tx, ti).await?;

        match linked_by_name(&mut tx, ti, name).await? {
            Some(existing) if existing == parameter_id => return Ok(parameter_id),
            Some(existing) => {
                return Err(ProvenanceError::Integrity(format!(
                    "task instance {} already has parameter '{name}' (pk={})",
                    ti.0, existing.0
                )))
            }
            None => link(&mut tx, ti, parameter_id).await?,
        }
        tx.commit().await?;

        debug!(pk = ti.0, name, parameter_pk = parameter_id.0, "Added parameter");
        Ok(parameter_id)
    }

    /// Unlink the parameter with this name. Returns false when it was absent.
    pub async fn remove_parameter(
        &self,
        instance: impl Into<TaskInstanceId>,
        name: &str,
    ) -> Result<bool, ProvenanceError> {
        let ti = instance.into();
        let mut tx = self.pool.begin().await?;
        let removed = unlink_by_name(&mut tx, ti, name).await?;
        tx.commit().await?;

        if removed {
            debug!(pk = ti.0, name, "Removed parameter");
        }
        Ok(removed)
    }

    /// Replace the value of every given key (remove, then add).
    pub async fn update_parameters(
        &self,
        instance: impl Into<TaskInstanceId>,
        parameters: &Parameters,
    ) -> Result<(), ProvenanceError> {
        let ti = instance.into();
        let parameter_ids = self.resolve(parameters).await?;

        let mut tx = self.pool.begin().await?;
        ensure_exists(&mut tx, ti).await?;
        for (name, parameter_id) in &parameter_ids {
            unlink_by_name(&mut tx, ti, name).await?;
            link(&mut tx, ti, *parameter_id).await?;
        }
        tx.commit().await?;

        debug!(pk = ti.0, count = parameter_ids.len(), "Updated parameters");
        Ok(())
    }

    /// Instances with no parameter links, optionally for one DAG.
    ///
    /// An empty parameter set is a valid identity, so these are candidates
    /// for review, not necessarily damaged rows.
    pub async fn find_unlinked(
        &self,
        dag_id: Option<&str>,
    ) -> Result<Vec<TaskInstance>, ProvenanceError> {
        let sql = format!(
            "{SELECT_INSTANCE} WHERE (? IS NULL OR ti.dag_id = ?) \
             AND NOT EXISTS (SELECT 1 FROM task_instance_parameter tip WHERE tip.ti_pk = ti.pk) \
             ORDER BY ti.pk"
        );
        let rows: Vec<TaskInstanceRow> = sqlx::query_as(&sql)
            .bind(dag_id)
            .bind(dag_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(into_instance).collect()
    }

    /// Insert any links missing between an instance and these parameters.
    ///
    /// Idempotent; returns the number of links added.
    pub async fn relink(
        &self,
        instance: impl Into<TaskInstanceId>,
        parameters: &Parameters,
    ) -> Result<usize, ProvenanceError> {
        let ti = instance.into();
        let parameter_ids = self.resolve(parameters).await?;

        let mut tx = self.pool.begin().await?;
        ensure_exists(&mut tx, ti).await?;
        let mut added = 0;
        for (_, parameter_id) in &parameter_ids {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO task_instance_parameter (ti_pk, parameter_pk) VALUES (?, ?)",
            )
            .bind(ti.0)
            .bind(parameter_id.0)
            .execute(&mut *tx)
            .await?;
            added += result.rows_affected() as usize;
        }
        tx.commit().await?;

        if added > 0 {
            warn!(pk = ti.0, added, "Re-linked missing task instance parameters");
        }
        Ok(added)
    }

    async fn resolve(
        &self,
        parameters: &Parameters,
    ) -> Result<Vec<(String, ParameterId)>, ProvenanceError> {
        let mut resolved = Vec::with_capacity(parameters.len());
        for (name, value) in parameters.iter() {
            let (id, _) = self.parameters.get_or_create(name, value).await?;
            resolved.push((name.to_string(), id));
        }
        Ok(resolved)
    }
}

async fn ensure_exists(
    conn: &mut SqliteConnection,
    ti: TaskInstanceId,
) -> Result<(), ProvenanceError> {
    let found: Option<i64> = sqlx::query_scalar("SELECT pk FROM task_instance WHERE pk = ?")
        .bind(ti.0)
        .fetch_optional(&mut *conn)
        .await?;

    match found {
        Some(_) => Ok(()),
        None => Err(ProvenanceError::NotFound {
            entity: "task_instance",
            pk: ti.0,
        }),
    }
}

async fn link(
    conn: &mut SqliteConnection,
    ti: TaskInstanceId,
    parameter: ParameterId,
) -> Result<(), ProvenanceError> {
    sqlx::query("INSERT INTO task_instance_parameter (ti_pk, parameter_pk) VALUES (?, ?)")
        .bind(ti.0)
        .bind(parameter.0)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn linked_by_name(
    conn: &mut SqliteConnection,
    ti: TaskInstanceId,
    name: &str,
) -> Result<Option<ParameterId>, ProvenanceError> {
    let pk: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT p.pk FROM task_instance_parameter tip
        JOIN parameter p ON p.pk = tip.parameter_pk
        WHERE tip.ti_pk = ? AND p.parameter_name = ?
        "#,
    )
    .bind(ti.0)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(pk.map(ParameterId))
}

async fn unlink_by_name(
    conn: &mut SqliteConnection,
    ti: TaskInstanceId,
    name: &str,
) -> Result<bool, ProvenanceError> {
    let result = sqlx::query(
        r#"
        DELETE FROM task_instance_parameter
        WHERE ti_pk = ?
          AND parameter_pk IN (SELECT pk FROM parameter WHERE parameter_name = ?)
        "#,
    )
    .bind(ti.0)
    .bind(name)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}
