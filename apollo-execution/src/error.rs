//! Execution errors.
use std::any::Any;
use std::fmt;

use displaydoc::Display;
use serde::Serialize;
use thiserror::Error;

use crate::graphql;
use crate::graphql::ErrorExtension;
use crate::json_ext::Object;
use crate::json_ext::Path;

/// Error types for the tracked scheduler.
#[derive(Error, Display, Debug, Clone, Serialize, Eq, PartialEq)]
#[non_exhaustive]
pub enum SchedulerError {
    /// the scheduler was shut down before the work item could complete
    ShutDown,

    /// work item panicked: {message}
    Panicked {
        /// The panic payload, when it was a string.
        message: String,
    },

    /// waiting for the scheduler was cancelled
    Cancelled,

    /// the tokio_blocking executor requires a Tokio runtime
    NoRuntime,

    /// could not start scheduler processors: {reason}
    SpawnFailed {
        /// The underlying executor error.
        reason: String,
    },
}

/// Error types for batch loading.
///
/// Errors are cloned to every caller waiting on a key, so they only carry owned strings.
#[derive(Error, Display, Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(untagged)]
#[non_exhaustive]
pub enum LoadError {
    /// loader '{loader}' failed to fetch: {reason}
    Fetch {
        /// The loader that issued the fetch.
        loader: String,

        /// The reason the fetch failed.
        reason: String,
    },

    /// loader '{loader}' panicked while fetching: {message}
    Panicked {
        /// The loader that issued the fetch.
        loader: String,

        /// The panic payload, when it was a string.
        message: String,
    },

    /// the load was cancelled because the operation was aborted
    Cancelled,

    /// the loader was dropped before the key was dispatched
    Abandoned,

    /// loader '{loader}' is not registered for this operation
    NotRegistered {
        /// The name of the loader type that was requested.
        loader: String,
    },
}

impl LoadError {
    pub fn fetch(loader: impl Into<String>, reason: impl fmt::Display) -> Self {
        LoadError::Fetch {
            loader: loader.into(),
            reason: reason.to_string(),
        }
    }
}

impl ErrorExtension for LoadError {
    fn extension_code(&self) -> String {
        match self {
            LoadError::Fetch { .. } => "LOADER_FETCH_ERROR",
            LoadError::Panicked { .. } => "LOADER_PANICKED",
            LoadError::Cancelled => "OPERATION_CANCELLED",
            LoadError::Abandoned => "LOADER_ABANDONED",
            LoadError::NotRegistered { .. } => "LOADER_NOT_REGISTERED",
        }
        .to_string()
    }
}

/// The outcome of resolver code that did not complete normally.
///
/// Resolvers return `Result<(), FieldError>`; a [`FieldError::Cancelled`] outcome is never
/// reported to the response.
#[derive(Error, Display, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum FieldError {
    /// the operation was cancelled
    Cancelled,

    /// {message}
    Resolver {
        /// The error message.
        message: String,

        /// Extra entries for the GraphQL error extensions.
        extensions: Object,
    },

    /// {0}
    Load(LoadError),

    /// resolver panicked: {message}
    Panicked {
        /// The panic payload, when it was a string.
        message: String,
    },
}

impl FieldError {
    pub fn new(message: impl Into<String>) -> Self {
        FieldError::Resolver {
            message: message.into(),
            extensions: Object::new(),
        }
    }

    /// Adds an entry to the extensions of a resolver error. Other variants are left unchanged.
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if let FieldError::Resolver { extensions, .. } = &mut self {
            extensions.insert(key.into(), value.into());
        }
        self
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, FieldError::Cancelled)
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        FieldError::Panicked {
            message: panic_message(payload.as_ref()),
        }
    }

    /// Convert the field error to a GraphQL error attached at `path`.
    pub fn to_graphql_error(&self, path: Option<Path>) -> graphql::Error {
        graphql::Error::builder()
            .message(self.to_string())
            .and_path(path)
            .extensions(self.custom_extension_details().unwrap_or_default())
            .extension_code(self.extension_code())
            .build()
    }
}

impl From<LoadError> for FieldError {
    fn from(error: LoadError) -> Self {
        match error {
            LoadError::Cancelled => FieldError::Cancelled,
            error => FieldError::Load(error),
        }
    }
}

impl ErrorExtension for FieldError {
    fn extension_code(&self) -> String {
        match self {
            FieldError::Cancelled => "OPERATION_CANCELLED".to_string(),
            FieldError::Resolver { .. } => "RESOLVER_ERROR".to_string(),
            FieldError::Load(error) => error.extension_code(),
            FieldError::Panicked { .. } => "RESOLVER_PANICKED".to_string(),
        }
    }

    fn custom_extension_details(&self) -> Option<Object> {
        match self {
            FieldError::Resolver { extensions, .. } => Some(extensions.clone()),
            FieldError::Load(error) => match serde_json::to_value(error) {
                Ok(serde_json::Value::Object(details)) => Some(details),
                _ => None,
            },
            FieldError::Cancelled | FieldError::Panicked { .. } => None,
        }
    }
}

/// Error types for operation execution.
#[derive(Error, Display, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum ExecutionError {
    /// the operation was cancelled
    Cancelled,

    /// loader '{loader}' is not registered for this operation
    LoaderNotRegistered {
        /// The name of the loader type that was requested.
        loader: String,
    },

    /// scheduler failure: {0}
    Scheduler(#[from] SchedulerError),
}

impl From<ExecutionError> for FieldError {
    fn from(error: ExecutionError) -> Self {
        match error {
            ExecutionError::Cancelled => FieldError::Cancelled,
            ExecutionError::LoaderNotRegistered { loader } => {
                FieldError::Load(LoadError::NotRegistered { loader })
            }
            error => FieldError::new(error.to_string()),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn cancelled_loads_become_cancelled_fields() {
        assert!(FieldError::from(LoadError::Cancelled).is_cancellation());
        assert_eq!(
            FieldError::from(LoadError::fetch("UserById", "timeout")),
            FieldError::Load(LoadError::Fetch {
                loader: "UserById".to_string(),
                reason: "timeout".to_string(),
            })
        );
    }

    #[test]
    fn resolver_error_to_graphql_error() {
        let error = FieldError::new("user not found").with_extension("id", 42);
        let graphql_error = error.to_graphql_error(Some(Path::from("/user")));
        assert_eq!(
            serde_json::to_value(&graphql_error).unwrap(),
            json!({
                "message": "user not found",
                "path": ["user"],
                "extensions": {
                    "id": 42,
                    "code": "RESOLVER_ERROR"
                }
            })
        );
    }

    #[test]
    fn load_error_to_graphql_error() {
        let error = FieldError::from(LoadError::fetch("UserById", "connection refused"));
        let graphql_error = error.to_graphql_error(Some(Path::from("/users/1/name")));
        insta::assert_yaml_snapshot!(graphql_error, @r###"
        message: "loader 'UserById' failed to fetch: connection refused"
        path:
          - users
          - 1
          - name
        extensions:
          loader: UserById
          reason: connection refused
          code: LOADER_FETCH_ERROR
        "###);
    }

    #[test]
    fn extension_details_per_variant() {
        assert_eq!(
            FieldError::from(LoadError::fetch("UserById", "timeout")).custom_extension_details(),
            Some(
                json!({ "loader": "UserById", "reason": "timeout" })
                    .as_object()
                    .cloned()
                    .unwrap()
            )
        );
        assert_eq!(FieldError::Cancelled.custom_extension_details(), None);
        let panicked = FieldError::Panicked {
            message: "boom".to_string(),
        };
        assert_eq!(panicked.custom_extension_details(), None);
        assert_eq!(
            panicked.to_graphql_error(None).extensions.len(),
            1,
            "only the code is set"
        );
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "<non-string panic payload>");
    }
}
