use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

const DEFAULT_TASK_POOL_CAPACITY: usize = 256;

fn default_task_pool_capacity() -> usize {
    DEFAULT_TASK_POOL_CAPACITY
}

/// Configuration for batch loaders
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct BatchingConfig {
    /// Maximum number of keys handed to a single fetch call. A round with more
    /// keys is split in several fetch calls. Unbounded by default.
    pub(crate) max_batch_size: Option<usize>,

    /// Keep resolved values for the remainder of the operation so that later
    /// rounds answer them without fetching again
    pub(crate) cache: bool,
}

#[buildstructor::buildstructor]
impl BatchingConfig {
    #[builder]
    pub fn new(max_batch_size: Option<usize>, cache: Option<bool>) -> Self {
        Self {
            max_batch_size,
            cache: cache.unwrap_or_default(),
        }
    }

    pub fn max_batch_size(&self) -> Option<usize> {
        self.max_batch_size
    }

    pub fn cache(&self) -> bool {
        self.cache
    }
}

/// Configuration for recycling execution tasks across operations
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct TaskPoolConfig {
    /// Maximum number of idle tasks kept for reuse; defaults to 256
    #[schemars(default = "default_task_pool_capacity")]
    pub(crate) capacity: usize,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_task_pool_capacity(),
        }
    }
}

impl TaskPoolConfig {
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
