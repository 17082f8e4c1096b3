//! Per-invocation checkpoint configuration.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// How a checkpointed run batches and persists its results.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Wall-clock time between checkpoints.
    #[serde(
        rename = "checkpoint_period_seconds",
        deserialize_with = "duration_from_secs"
    )]
    pub checkpoint_period: Duration,

    /// Maximum rows per insert chunk.
    pub batch_size: usize,

    /// Propagate computation and write failures instead of logging them.
    pub re_raise_on_error: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_period: Duration::from_secs(300),
            batch_size: 999,
            re_raise_on_error: true,
        }
    }
}

impl CheckpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the time between checkpoints.
    pub fn with_checkpoint_period(mut self, period: Duration) -> Self {
        self.checkpoint_period = period;
        self
    }

    /// Set the maximum rows per insert chunk.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Choose between fail-fast (`true`) and log-and-continue (`false`).
    pub fn with_re_raise(mut self, re_raise: bool) -> Self {
        self.re_raise_on_error = re_raise;
        self
    }
}

fn duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
