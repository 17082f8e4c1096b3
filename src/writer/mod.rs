//! Bounded batch writes of result records.

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::ProvenanceError;
use crate::model::{OutputModel, Record};

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{ReturningWriter, RowByRowWriter, SqlBatchWriter, WriteStrategy};

/// What a successful write did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Number of chunks, each committed in its own transaction.
    pub chunks: usize,
    pub rows: usize,
}

/// Result of a flush under the caller's failure policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every record was written and carries its generated pk.
    Persisted(WriteSummary),
    /// The write failed and the failure was tolerated. Records without a
    /// pk were not saved.
    NotGuaranteed { error: String, unsaved: usize },
}

impl FlushOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted(_))
    }
}

/// Persists records in chunks and annotates each with its generated pk.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    /// Write `records` in chunks of at most `batch_size`.
    ///
    /// On success every record has `pk` set. On failure, records in chunks
    /// committed before the fault keep their pks and the rest stay `None`.
    async fn write<M: OutputModel>(
        &self,
        records: &mut [Record<M>],
        batch_size: usize,
    ) -> Result<WriteSummary, ProvenanceError>;

    /// Write `records`, applying the failure policy.
    ///
    /// With `re_raise`, write faults propagate. Without it, they are logged
    /// and reported as `NotGuaranteed` so the caller can still hand the
    /// records on.
    async fn flush<M: OutputModel>(
        &self,
        records: &mut [Record<M>],
        batch_size: usize,
        re_raise: bool,
    ) -> Result<FlushOutcome, ProvenanceError> {
        match self.write(records, batch_size).await {
            Ok(summary) => {
                info!(
                    table = M::table(),
                    rows = summary.rows,
                    chunks = summary.chunks,
                    "Saved results to database"
                );
                Ok(FlushOutcome::Persisted(summary))
            }
            Err(e) if e.is_write_fault() && !re_raise => {
                let unsaved = records.iter().filter(|r| !r.is_persisted()).count();
                warn!(
                    table = M::table(),
                    error = %e,
                    unsaved,
                    "Results will be returned but are not saved"
                );
                Ok(FlushOutcome::NotGuaranteed {
                    error: e.to_string(),
                    unsaved,
                })
            }
            Err(e) => {
                error!(table = M::table(), error = %e, "Failed to save results to database");
                Err(e)
            }
        }
    }
}
