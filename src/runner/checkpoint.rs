//! Periodic-checkpoint runner for streaming computations.
//!
//! A run pulls records from its computation and buffers them. When the
//! checkpoint period has elapsed (checked after each record) the buffer is
//! flushed through the batch writer, the flushed records are handed to the
//! consumer, and the timer restarts. Exhausting the computation drains
//! whatever is left.
//!
//! ```text
//! Running ──period elapsed──▶ Checkpointing ──flushed──▶ Running
//!    │                                │
//!    └──exhausted──▶ Draining ──flushed──▶ Done
//!    └──error (fail-fast)──▶ Failed ◀──write fault (fail-fast)
//! ```

use futures::stream::{self, Stream, TryStreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::computation::Computation;
use super::config::CheckpointConfig;
use crate::error::ProvenanceError;
use crate::model::Record;
use crate::writer::{BatchWriter, FlushOutcome};

/// Where a single invocation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerPhase {
    Running,
    Checkpointing,
    Draining,
    Done,
    Failed,
}

impl RunnerPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Drives computations with periodic checkpoints through a shared writer.
///
/// Each call to [`run`](Self::run) is an independent invocation with its
/// own buffer and timer.
pub struct CheckpointedRunner<W> {
    writer: Arc<W>,
    config: CheckpointConfig,
}

impl<W> Clone for CheckpointedRunner<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            config: self.config.clone(),
        }
    }
}

impl<W: BatchWriter + 'static> CheckpointedRunner<W> {
    pub fn new(writer: W, config: CheckpointConfig) -> Self {
        Self::with_shared_writer(Arc::new(writer), config)
    }

    pub fn with_shared_writer(writer: Arc<W>, config: CheckpointConfig) -> Self {
        Self { writer, config }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Run `computation`, yielding each record once it has been through a
    /// flush.
    ///
    /// Records come out in the order the computation produced them. Under
    /// fail-fast, the first computation error or write fault is yielded
    /// and the stream ends; unflushed records are discarded.
    pub fn run<C>(
        &self,
        computation: C,
    ) -> impl Stream<Item = Result<Record<C::Output>, ProvenanceError>> + Send + 'static
    where
        C: Computation + 'static,
    {
        let invocation = Invocation::new(computation, Arc::clone(&self.writer), self.config.clone());
        stream::unfold(invocation, |mut invocation| async move {
            invocation.step().await.map(|item| (item, invocation))
        })
    }

    /// Run `computation` to the end and collect its records.
    pub async fn run_to_end<C>(
        &self,
        computation: C,
    ) -> Result<Vec<Record<C::Output>>, ProvenanceError>
    where
        C: Computation + 'static,
    {
        self.run(computation).try_collect().await
    }
}

struct Invocation<C: Computation, W> {
    computation: C,
    writer: Arc<W>,
    config: CheckpointConfig,
    phase: RunnerPhase,
    pending: Vec<Record<C::Output>>,
    ready: VecDeque<Record<C::Output>>,
    /// Unset until the stream is first polled.
    last_checkpoint: Option<Instant>,
    checkpoints: usize,
    produced: usize,
    unsaved: usize,
}

impl<C: Computation, W: BatchWriter> Invocation<C, W> {
    fn new(computation: C, writer: Arc<W>, config: CheckpointConfig) -> Self {
        Self {
            computation,
            writer,
            config,
            phase: RunnerPhase::Running,
            pending: Vec::new(),
            ready: VecDeque::new(),
            last_checkpoint: None,
            checkpoints: 0,
            produced: 0,
            unsaved: 0,
        }
    }

    fn transition(&mut self, next: RunnerPhase) {
        debug!(task = self.computation.name(), from = ?self.phase, to = ?next, "Runner transition");
        self.phase = next;
    }

    async fn step(&mut self) -> Option<Result<Record<C::Output>, ProvenanceError>> {
        self.last_checkpoint.get_or_insert_with(Instant::now);
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Some(Ok(record));
            }

            match self.phase {
                RunnerPhase::Done | RunnerPhase::Failed => return None,
                RunnerPhase::Checkpointing | RunnerPhase::Draining => {
                    if let Err(e) = self.checkpoint().await {
                        self.transition(RunnerPhase::Failed);
                        return Some(Err(e));
                    }
                    if self.phase == RunnerPhase::Draining {
                        self.transition(RunnerPhase::Done);
                        info!(
                            task = self.computation.name(),
                            records = self.produced,
                            checkpoints = self.checkpoints,
                            unsaved = self.unsaved,
                            "Task complete"
                        );
                    } else {
                        self.transition(RunnerPhase::Running);
                    }
                }
                RunnerPhase::Running => match self.computation.next_record().await {
                    Some(Ok(record)) => {
                        self.produced += 1;
                        self.pending.push(record);
                        let period = self.config.checkpoint_period;
                        if self.last_checkpoint.is_some_and(|t| t.elapsed() >= period) {
                            self.transition(RunnerPhase::Checkpointing);
                        }
                    }
                    Some(Err(source)) => {
                        let task = self.computation.name();
                        error!(task, error = %source, "Exception raised in task");
                        if self.config.re_raise_on_error {
                            if !self.pending.is_empty() {
                                warn!(task, dropped = self.pending.len(), "Discarding unflushed results");
                                self.pending.clear();
                            }
                            self.transition(RunnerPhase::Failed);
                            return Some(Err(ProvenanceError::Computation { task, source }));
                        }
                    }
                    None => self.transition(RunnerPhase::Draining),
                },
            }
        }
    }

    /// Flush the buffer and move its records to the ready queue.
    async fn checkpoint(&mut self) -> Result<(), ProvenanceError> {
        let mut batch = std::mem::take(&mut self.pending);
        if !batch.is_empty() {
            let outcome = self
                .writer
                .flush(&mut batch, self.config.batch_size, self.config.re_raise_on_error)
                .await?;
            if let FlushOutcome::NotGuaranteed { unsaved, .. } = outcome {
                self.unsaved += unsaved;
            }
            self.checkpoints += 1;
            debug!(
                task = self.computation.name(),
                records = batch.len(),
                checkpoint = self.checkpoints,
                "Checkpoint flushed"
            );
            self.ready.extend(batch);
        }
        self.last_checkpoint = Some(Instant::now());
        Ok(())
    }
}
