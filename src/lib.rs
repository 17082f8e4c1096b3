//! # Provflow
//!
//! Provenance and checkpointed persistence for data-processing tasks.
//!
//! Every task execution is identified by `(dag_id, task_id, run_id)` plus
//! the exact set of parameters it ran with. Results are written to typed
//! tables in bounded batches, each row tagged with the task instance that
//! produced it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use provflow::{
//!     from_iter, CheckpointConfig, CheckpointedRunner, Parameters, Record, SqlBatchWriter,
//!     TaskInstanceRegistry,
//! };
//!
//! provflow::schema::run_migrations(&pool).await?;
//! let registry = TaskInstanceRegistry::new(pool.clone());
//!
//! let params = Parameters::new().with("release", "sdss5").with("mjd", 59000);
//! let instance = registry.get_or_create("ingest", "classify", Some("r1"), &params).await?;
//!
//! let runner = CheckpointedRunner::new(SqlBatchWriter::sqlite(pool), CheckpointConfig::default());
//! let records = sources.into_iter().map(|s| Ok(Record::new(classify(s)).for_task(instance.id)));
//! let saved = runner.run_to_end(from_iter("classify", records)).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite-backed stores and batch writers (default)

pub mod error;
pub mod handoff;
pub mod model;
pub mod runner;
pub mod value;
pub mod writer;

pub use error::ProvenanceError;
pub use handoff::{
    deserialize_flat_pks, deserialize_pks, serialize_pks_to_path, PkHandoff, PkInput, PkTree,
    TempPathOptions,
};
pub use model::{
    Column, ColumnType, FieldValues, OutputId, OutputModel, ParameterId, Record, SqlValue,
    TaskInstanceId,
};
pub use runner::{
    from_iter, from_stream, CheckpointConfig, CheckpointedRunner, Computation, RunnerPhase,
    StreamComputation,
};
pub use value::{ParamValue, Parameters};
pub use writer::{BatchWriter, FlushOutcome, WriteSummary};

#[cfg(feature = "sqlite")]
pub mod output;

#[cfg(feature = "sqlite")]
pub mod parameter;

#[cfg(feature = "sqlite")]
pub mod registry;

#[cfg(feature = "sqlite")]
pub mod schema;

#[cfg(feature = "sqlite")]
pub use output::OutputLinker;

#[cfg(feature = "sqlite")]
pub use parameter::ParameterStore;

#[cfg(feature = "sqlite")]
pub use registry::{TaskInstance, TaskInstanceRegistry};

#[cfg(feature = "sqlite")]
pub use writer::{ReturningWriter, RowByRowWriter, SqlBatchWriter, WriteStrategy};
