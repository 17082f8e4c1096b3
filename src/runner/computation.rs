//! The lazily-producing unit of work a runner drives.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;

use crate::model::{OutputModel, Record};

/// A task's computation: yields result records one pull at a time.
///
/// It cannot be restarted mid-stream; running it again means building a
/// new one.
#[async_trait]
pub trait Computation: Send {
    /// The result model this computation produces.
    type Output: OutputModel;

    /// The name of this computation for logging.
    fn name(&self) -> &'static str;

    /// Produce the next record, or `None` when exhausted.
    async fn next_record(&mut self) -> Option<anyhow::Result<Record<Self::Output>>>;
}

/// Computation backed by any stream of records.
pub struct StreamComputation<S> {
    name: &'static str,
    stream: Pin<Box<S>>,
}

/// Wrap a stream of records as a computation.
pub fn from_stream<S, M>(name: &'static str, stream: S) -> StreamComputation<S>
where
    S: Stream<Item = anyhow::Result<Record<M>>> + Send,
    M: OutputModel,
{
    StreamComputation {
        name,
        stream: Box::pin(stream),
    }
}

/// Wrap an iterator of records as a computation.
pub fn from_iter<I, M>(name: &'static str, iter: I) -> StreamComputation<stream::Iter<I::IntoIter>>
where
    I: IntoIterator<Item = anyhow::Result<Record<M>>>,
    I::IntoIter: Send,
    M: OutputModel,
{
    from_stream(name, stream::iter(iter))
}

#[async_trait]
impl<S, M> Computation for StreamComputation<S>
where
    S: Stream<Item = anyhow::Result<Record<M>>> + Send,
    M: OutputModel,
{
    type Output = M;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn next_record(&mut self) -> Option<anyhow::Result<Record<M>>> {
        self.stream.next().await
    }
}
