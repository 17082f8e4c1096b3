//! Checkpointed execution of result-producing computations.

pub mod checkpoint;
pub mod computation;
pub mod config;

pub use checkpoint::{CheckpointedRunner, RunnerPhase};
pub use computation::{from_iter, from_stream, Computation, StreamComputation};
pub use config::CheckpointConfig;
