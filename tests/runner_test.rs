//! Tests for CheckpointedRunner.

use async_trait::async_trait;
use futures::StreamExt;
use provflow::{
    from_iter, BatchWriter, CheckpointConfig, CheckpointedRunner, Column, Computation,
    FieldValues, OutputModel, ProvenanceError, Record, SqlValue, WriteSummary,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
struct Square {
    n: i64,
    square: i64,
}

impl OutputModel for Square {
    fn table() -> &'static str {
        "square"
    }

    fn columns() -> Vec<Column> {
        vec![Column::integer("n"), Column::integer("square")]
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![self.n.into(), self.square.into()]
    }

    fn from_values(values: &FieldValues) -> Result<Self, ProvenanceError> {
        Ok(Self {
            n: values.i64("n")?,
            square: values.i64("square")?,
        })
    }
}

fn square(n: i64) -> anyhow::Result<Record<Square>> {
    Ok(Record::new(Square { n, square: n * n }))
}

/// Assigns pks in memory and remembers the size of every write.
#[derive(Default)]
struct CountingWriter {
    next_pk: AtomicI64,
    writes: Mutex<Vec<usize>>,
}

impl CountingWriter {
    fn writes(&self) -> Vec<usize> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchWriter for CountingWriter {
    async fn write<M: OutputModel>(
        &self,
        records: &mut [Record<M>],
        batch_size: usize,
    ) -> Result<WriteSummary, ProvenanceError> {
        self.writes.lock().unwrap().push(records.len());
        for record in records.iter_mut() {
            record.pk = Some(self.next_pk.fetch_add(1, Ordering::SeqCst) + 1);
        }
        Ok(WriteSummary {
            chunks: records.len().div_ceil(batch_size),
            rows: records.len(),
        })
    }
}

/// Fails every write.
struct BrokenWriter;

#[async_trait]
impl BatchWriter for BrokenWriter {
    async fn write<M: OutputModel>(
        &self,
        _records: &mut [Record<M>],
        _batch_size: usize,
    ) -> Result<WriteSummary, ProvenanceError> {
        Err(ProvenanceError::Persistence("database is locked".to_string()))
    }
}

/// Yields squares, failing on the listed inputs.
struct FlakyComputation {
    next: i64,
    end: i64,
    fail_on: Vec<i64>,
}

#[async_trait]
impl Computation for FlakyComputation {
    type Output = Square;

    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn next_record(&mut self) -> Option<anyhow::Result<Record<Square>>> {
        if self.next >= self.end {
            return None;
        }
        let n = self.next;
        self.next += 1;
        if self.fail_on.contains(&n) {
            return Some(Err(anyhow::anyhow!("cannot square {n}")));
        }
        Some(square(n))
    }
}

/// Takes 100 seconds per record.
struct SlowComputation {
    remaining: i64,
}

#[async_trait]
impl Computation for SlowComputation {
    type Output = Square;

    fn name(&self) -> &'static str {
        "slow"
    }

    async fn next_record(&mut self) -> Option<anyhow::Result<Record<Square>>> {
        if self.remaining == 0 {
            return None;
        }
        tokio::time::sleep(Duration::from_secs(100)).await;
        self.remaining -= 1;
        Some(square(self.remaining))
    }
}

fn every_record() -> CheckpointConfig {
    CheckpointConfig::default().with_checkpoint_period(Duration::ZERO)
}

#[tokio::test]
async fn test_zero_period_checkpoints_every_record() {
    let writer = Arc::new(CountingWriter::default());
    let runner = CheckpointedRunner::with_shared_writer(writer.clone(), every_record());

    let records = runner
        .run_to_end(from_iter("squares", (0..5).map(square)))
        .await
        .unwrap();

    assert_eq!(writer.writes(), vec![1, 1, 1, 1, 1]);
    assert_eq!(
        records.iter().map(|r| r.fields.n).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4]
    );
    assert!(records.iter().all(Record::is_persisted));
}

#[tokio::test]
async fn test_default_period_flushes_once_at_end() {
    let writer = Arc::new(CountingWriter::default());
    let runner = CheckpointedRunner::with_shared_writer(writer.clone(), CheckpointConfig::default());

    let records = runner
        .run_to_end(from_iter("squares", (0..50).map(square)))
        .await
        .unwrap();

    assert_eq!(writer.writes(), vec![50]);
    assert_eq!(records.len(), 50);
    assert_eq!(records[49].pk, Some(50));
}

#[tokio::test]
async fn test_empty_computation_writes_nothing() {
    let writer = Arc::new(CountingWriter::default());
    let runner = CheckpointedRunner::with_shared_writer(writer.clone(), every_record());

    let records = runner
        .run_to_end(from_iter("empty", std::iter::empty::<anyhow::Result<Record<Square>>>()))
        .await
        .unwrap();

    assert!(records.is_empty());
    assert!(writer.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_checkpoints_follow_the_clock() {
    let writer = Arc::new(CountingWriter::default());
    let config = CheckpointConfig::default().with_checkpoint_period(Duration::from_secs(250));
    let runner = CheckpointedRunner::with_shared_writer(writer.clone(), config);

    let records = runner
        .run_to_end(SlowComputation { remaining: 7 })
        .await
        .unwrap();

    // Records land at 100s intervals; the timer restarts after each flush.
    assert_eq!(writer.writes(), vec![3, 3, 1]);
    assert_eq!(records.len(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_records_are_released_only_after_a_flush() {
    let writer = Arc::new(CountingWriter::default());
    let config = CheckpointConfig::default().with_checkpoint_period(Duration::from_secs(250));
    let runner = CheckpointedRunner::with_shared_writer(writer.clone(), config);

    let mut stream = Box::pin(runner.run(SlowComputation { remaining: 4 }));
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.is_persisted());
    assert_eq!(writer.writes(), vec![3]);

    let rest: Vec<_> = stream.collect().await;
    assert_eq!(rest.len(), 3);
    assert_eq!(writer.writes(), vec![3, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_timer_starts_on_first_poll() {
    let writer = Arc::new(CountingWriter::default());
    let config = CheckpointConfig::default().with_checkpoint_period(Duration::from_secs(250));
    let runner = CheckpointedRunner::with_shared_writer(writer.clone(), config);

    let stream = runner.run(SlowComputation { remaining: 4 });
    tokio::time::sleep(Duration::from_secs(1000)).await;

    let records: Vec<_> = stream.collect().await;
    assert_eq!(records.len(), 4);
    assert_eq!(writer.writes(), vec![3, 1]);
}

#[tokio::test]
async fn test_fail_fast_stops_after_flushed_records() {
    let writer = Arc::new(CountingWriter::default());
    let runner = CheckpointedRunner::with_shared_writer(writer.clone(), every_record());

    let items: Vec<_> = runner
        .run(FlakyComputation {
            next: 0,
            end: 10,
            fail_on: vec![2],
        })
        .collect()
        .await;

    assert_eq!(items.len(), 3);
    assert!(items[0].is_ok() && items[1].is_ok());
    match &items[2] {
        Err(ProvenanceError::Computation { task, source }) => {
            assert_eq!(*task, "flaky");
            assert_eq!(source.to_string(), "cannot square 2");
        }
        other => panic!("expected computation error, got {other:?}"),
    }
    assert_eq!(writer.writes(), vec![1, 1]);
}

#[tokio::test]
async fn test_fail_fast_discards_unflushed_records() {
    let writer = Arc::new(CountingWriter::default());
    let runner = CheckpointedRunner::with_shared_writer(writer.clone(), CheckpointConfig::default());

    let result = runner
        .run_to_end(FlakyComputation {
            next: 0,
            end: 10,
            fail_on: vec![5],
        })
        .await;

    assert!(matches!(result, Err(ProvenanceError::Computation { .. })));
    assert!(writer.writes().is_empty());
}

#[tokio::test]
async fn test_tolerant_run_skips_failed_records() {
    let writer = Arc::new(CountingWriter::default());
    let config = every_record().with_re_raise(false);
    let runner = CheckpointedRunner::with_shared_writer(writer.clone(), config);

    let records = runner
        .run_to_end(FlakyComputation {
            next: 0,
            end: 6,
            fail_on: vec![1, 4],
        })
        .await
        .unwrap();

    assert_eq!(
        records.iter().map(|r| r.fields.n).collect::<Vec<_>>(),
        vec![0, 2, 3, 5]
    );
    assert_eq!(writer.writes().len(), 4);
}

#[tokio::test]
async fn test_write_fault_fails_fast() {
    let runner = CheckpointedRunner::new(BrokenWriter, every_record());

    let items: Vec<_> = runner
        .run(from_iter("squares", (0..3).map(square)))
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(ProvenanceError::Persistence(_))));
}

#[tokio::test]
async fn test_tolerated_write_fault_still_yields_records() {
    let runner = CheckpointedRunner::new(BrokenWriter, every_record().with_re_raise(false));

    let records = runner
        .run_to_end(from_iter("squares", (0..3).map(square)))
        .await
        .unwrap();

    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.pk.is_none()));
}

#[tokio::test]
async fn test_concurrent_invocations_share_a_writer() {
    let writer = Arc::new(CountingWriter::default());
    let runner = CheckpointedRunner::with_shared_writer(writer.clone(), every_record());

    let (left, right) = tokio::join!(
        runner.run_to_end(from_iter("left", (0..20).map(square))),
        runner.run_to_end(from_iter("right", (100..120).map(square))),
    );
    let (left, right) = (left.unwrap(), right.unwrap());

    assert_eq!(left.len(), 20);
    assert_eq!(right.len(), 20);
    assert!(left.iter().all(|r| r.fields.n < 100));
    assert!(right.iter().all(|r| r.fields.n >= 100));

    let mut pks: Vec<i64> = left.iter().chain(&right).map(|r| r.pk.unwrap()).collect();
    pks.sort();
    pks.dedup();
    assert_eq!(pks.len(), 40);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_run_persists_through_sqlite() {
    use provflow::{Parameters, SqlBatchWriter, TaskInstanceRegistry};
    use sqlx::SqlitePool;

    let pool = SqlitePool::connect(":memory:").await.unwrap();
    provflow::schema::run_migrations(&pool).await.unwrap();
    let instance = TaskInstanceRegistry::new(pool.clone())
        .get_or_create("math", "squares", None, &Parameters::new().with("limit", 1200))
        .await
        .unwrap();

    let runner = CheckpointedRunner::new(
        SqlBatchWriter::sqlite(pool.clone()),
        CheckpointConfig::default().with_batch_size(500),
    );
    let records = runner
        .run_to_end(from_iter(
            "squares",
            (0..1200).map(move |n| square(n).map(|r| r.for_task(instance.id))),
        ))
        .await
        .unwrap();

    assert_eq!(records.len(), 1200);
    assert!(records.iter().all(Record::is_persisted));

    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM square WHERE ti_pk = ?")
        .bind(instance.id.0)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(stored, 1200);
}
