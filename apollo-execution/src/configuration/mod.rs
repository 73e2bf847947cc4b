//! Logic for loading configuration in to an object model
mod batching;
mod scheduler;

use std::str::FromStr;

use displaydoc::Display;
use schemars::JsonSchema;
use schemars::schema::RootSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub use self::batching::BatchingConfig;
pub use self::batching::TaskPoolConfig;
pub use self::scheduler::SchedulerConfig;
pub use self::scheduler::UnderlyingKind;

/// Configuration error.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not deserialize configuration: {0}
    DeserializeConfigError(serde_yaml::Error),
    /// {message}: {error}
    InvalidConfiguration {
        message: &'static str,
        error: String,
    },
}

/// The configuration of operation execution.
///
/// Can be created through `serde::Deserialize` from various formats,
/// or inline in Rust code with `serde_json::json!` and `serde_json::from_value`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Configuration options pertaining to the tracked scheduler.
    pub(crate) scheduler: SchedulerConfig,

    /// Batch loader options.
    pub(crate) batching: BatchingConfig,

    /// Task recycling options.
    pub(crate) task_pool: TaskPoolConfig,
}

#[buildstructor::buildstructor]
impl Configuration {
    #[builder]
    pub fn new(
        scheduler: Option<SchedulerConfig>,
        batching: Option<BatchingConfig>,
        task_pool: Option<TaskPoolConfig>,
    ) -> Result<Self, ConfigurationError> {
        let configuration = Self {
            scheduler: scheduler.unwrap_or_default(),
            batching: batching.unwrap_or_default(),
            task_pool: task_pool.unwrap_or_default(),
        };
        configuration.validate()
    }

    pub fn scheduler(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    pub fn batching(&self) -> &BatchingConfig {
        &self.batching
    }

    pub fn task_pool(&self) -> &TaskPoolConfig {
        &self.task_pool
    }

    /// The JSON schema of the configuration file.
    pub fn json_schema() -> RootSchema {
        schemars::schema_for!(Configuration)
    }

    fn validate(self) -> Result<Self, ConfigurationError> {
        if self.scheduler.processors == Some(0) {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "scheduler.processors must be greater than 0",
                error: "processors: 0".to_string(),
            });
        }
        if self.scheduler.poll_timeout.is_zero() {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "scheduler.poll_timeout must be greater than 0",
                error: "poll_timeout: 0s".to_string(),
            });
        }
        if self.batching.max_batch_size == Some(0) {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "batching.max_batch_size must be greater than 0",
                error: "max_batch_size: 0".to_string(),
            });
        }
        Ok(self)
    }
}

/// Parse configuration from a YAML document.
impl FromStr for Configuration {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let configuration: Configuration =
            serde_yaml::from_str(s).map_err(ConfigurationError::DeserializeConfigError)?;
        configuration.validate()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let configuration = Configuration::from_str("{}").unwrap();
        assert_eq!(
            configuration.scheduler().poll_timeout(),
            Duration::from_millis(50)
        );
        assert_eq!(configuration.batching().max_batch_size(), None);
        assert!(!configuration.batching().cache());
        assert_eq!(configuration.task_pool().capacity(), 256);
    }

    #[test]
    fn parses_full_yaml_document() {
        let configuration = Configuration::from_str(
            r#"
scheduler:
  processors: 2
  poll_timeout: 5ms
  executor: tokio_blocking
batching:
  max_batch_size: 100
  cache: true
task_pool:
  capacity: 16
"#,
        )
        .unwrap();

        assert_eq!(configuration.scheduler().processors(), 2);
        assert_eq!(
            configuration.scheduler().poll_timeout(),
            Duration::from_millis(5)
        );
        assert_eq!(
            configuration.scheduler().executor(),
            UnderlyingKind::TokioBlocking
        );
        assert_eq!(configuration.batching().max_batch_size(), Some(100));
        assert!(configuration.batching().cache());
        assert_eq!(configuration.task_pool().capacity(), 16);
    }

    #[rstest]
    #[case::zero_processors("scheduler:\n  processors: 0\n")]
    #[case::zero_poll_timeout("scheduler:\n  poll_timeout: 0s\n")]
    #[case::zero_batch_size("batching:\n  max_batch_size: 0\n")]
    fn rejects_invalid_values(#[case] yaml: &str) {
        assert!(matches!(
            Configuration::from_str(yaml),
            Err(ConfigurationError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(matches!(
            Configuration::from_str("scheduler:\n  workers: 2\n"),
            Err(ConfigurationError::DeserializeConfigError(_))
        ));
    }

    #[test]
    fn builder_validates() {
        assert!(
            Configuration::builder()
                .batching(BatchingConfig::builder().max_batch_size(0).build())
                .build()
                .is_err()
        );
        assert!(Configuration::builder().build().is_ok());
    }

    #[test]
    fn schema_lists_top_level_sections() {
        let schema = serde_json::to_value(Configuration::json_schema()).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        assert!(properties.contains_key("scheduler"));
        assert!(properties.contains_key("batching"));
        assert!(properties.contains_key("task_pool"));
    }
}
