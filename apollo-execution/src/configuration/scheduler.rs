use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(50);

fn default_poll_timeout() -> Duration {
    DEFAULT_POLL_TIMEOUT
}

/// The executor hosting the processor loops of a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum UnderlyingKind {
    /// One dedicated OS thread per processor loop.
    #[default]
    Threads,
    /// Processor loops run on the blocking pool of the current Tokio runtime.
    TokioBlocking,
}

/// Configuration for the tracked scheduler
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    /// Number of processor loops; defaults to the available parallelism
    pub(crate) processors: Option<usize>,

    /// How long a processor waits for work before re-checking the shutdown signal,
    /// in human-readable format; defaults to 50ms
    #[serde(
        deserialize_with = "humantime_serde::deserialize",
        serialize_with = "humantime_serde::serialize",
        default = "default_poll_timeout"
    )]
    #[schemars(with = "String", default = "default_poll_timeout")]
    pub(crate) poll_timeout: Duration,

    /// The executor hosting the processor loops
    pub(crate) executor: UnderlyingKind,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[buildstructor::buildstructor]
impl SchedulerConfig {
    #[builder]
    pub fn new(
        processors: Option<usize>,
        poll_timeout: Option<Duration>,
        executor: Option<UnderlyingKind>,
    ) -> Self {
        Self {
            processors,
            poll_timeout: poll_timeout.unwrap_or_else(default_poll_timeout),
            executor: executor.unwrap_or_default(),
        }
    }

    /// Let the scheduler use all available resources if it can.
    pub fn processors(&self) -> usize {
        self.processors.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn executor(&self) -> UnderlyingKind {
        self.executor
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn it_builds_default_scheduler_configuration() {
        let config = SchedulerConfig::builder().build();
        assert_eq!(config.poll_timeout(), Duration::from_millis(50));
        assert_eq!(config.executor(), UnderlyingKind::Threads);
        assert!(config.processors() >= 1);
    }

    #[test]
    fn it_json_parses_specified_poll_timeout() {
        let config: SchedulerConfig = serde_json::from_value(json!({
            "poll_timeout": "10ms",
            "processors": 3,
            "executor": "tokio_blocking"
        }))
        .unwrap();

        assert_eq!(config.poll_timeout(), Duration::from_millis(10));
        assert_eq!(config.processors(), 3);
        assert_eq!(config.executor(), UnderlyingKind::TokioBlocking);
    }

    #[test]
    fn test_deny_unknown_fields() {
        let result: Result<SchedulerConfig, _> =
            serde_json::from_value(json!({ "poll_timeout": "10ms", "threads": 2 }));
        assert!(result.unwrap_err().to_string().contains("unknown field"));
    }
}
