//! Concurrent execution of GraphQL selection trees.
//!
//! The crate drives resolver tasks through a tracked worker pool and coordinates
//! batched data loading so that every key requested during one wave of work is
//! fetched in a single round.

#![cfg_attr(feature = "failfast", allow(unreachable_code))]
#![warn(unreachable_pub)]

macro_rules! failfast_debug {
    ($($tokens:tt)+) => {{
        tracing::debug!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

macro_rules! failfast_error {
    ($($tokens:tt)+) => {{
        tracing::error!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

pub mod configuration;
pub mod error;
pub mod execution;
pub mod graphql;
pub mod json_ext;
pub mod loader;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use configuration::Configuration;
pub use error::ExecutionError;
pub use error::FieldError;
pub use error::LoadError;
pub use error::SchedulerError;
pub use execution::ExecutionResult;
pub use execution::OperationExecutor;
pub use execution::ResolverContext;
pub use execution::RootTaskProvider;
pub use loader::DataLoader;
pub use queue::ExecutionQueue;
pub use scheduler::TrackableScheduler;
pub use task::ExecutionTask;
pub use task::TaskKind;
pub use task::TaskStatus;
