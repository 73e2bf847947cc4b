use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;

use crate::error::LoadError;
use crate::error::panic_message;

/// Keys of a loader: deduplicated by equality within a round.
pub trait LoaderKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> LoaderKey for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Values of a loader. Each waiter of a key receives its own clone, wrap values in an `Arc`
/// to share a single allocation.
pub trait LoaderValue: Clone + Send + Sync + 'static {}

impl<T> LoaderValue for T where T: Clone + Send + Sync + 'static {}

/// How a loader maps keys to results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    /// One fetch per round for all keys, at most one value per key.
    Batch,
    /// One fetch per round for all keys, any number of values per key.
    Group,
    /// One fetch per key, failures only affect their own key.
    Cache,
}

/// A declared loader: turns the keys of one round in one result per key.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    type Key: LoaderKey;
    type Value: LoaderValue;

    fn kind(&self) -> LoaderKind;

    /// Name used in errors and spans.
    fn name(&self) -> String;

    /// Fetches `keys` and returns one result per key, in the order of `keys`.
    async fn dispatch(&self, keys: Vec<Self::Key>) -> Vec<Result<Self::Value, LoadError>>;
}

/// Fetches many keys at once; keys missing from the result resolve to `None`.
#[async_trait]
pub trait BatchFetch: Send + Sync + 'static {
    type Key: LoaderKey;
    type Value: LoaderValue;
    type Error: fmt::Display + Send;

    async fn fetch(
        &self,
        keys: &[Self::Key],
    ) -> Result<HashMap<Self::Key, Self::Value>, Self::Error>;
}

/// Fetches many keys at once; keys missing from the result resolve to an empty list.
#[async_trait]
pub trait GroupFetch: Send + Sync + 'static {
    type Key: LoaderKey;
    type Value: LoaderValue;
    type Error: fmt::Display + Send;

    async fn fetch(
        &self,
        keys: &[Self::Key],
    ) -> Result<HashMap<Self::Key, Vec<Self::Value>>, Self::Error>;
}

/// Fetches a single key.
#[async_trait]
pub trait CacheFetch: Send + Sync + 'static {
    type Key: LoaderKey;
    type Value: LoaderValue;
    type Error: fmt::Display + Send;

    async fn fetch(&self, key: &Self::Key) -> Result<Self::Value, Self::Error>;
}

/// A [`BatchFetch`] declared as a loader.
#[derive(Debug, Clone)]
pub struct Batch<F>(pub F);

/// A [`GroupFetch`] declared as a loader.
#[derive(Debug, Clone)]
pub struct Group<F>(pub F);

/// A [`CacheFetch`] declared as a loader.
#[derive(Debug, Clone)]
pub struct Cache<F>(pub F);

#[async_trait]
impl<F: BatchFetch> Dispatch for Batch<F> {
    type Key = F::Key;
    type Value = Option<F::Value>;

    fn kind(&self) -> LoaderKind {
        LoaderKind::Batch
    }

    fn name(&self) -> String {
        short_type_name::<F>()
    }

    async fn dispatch(&self, keys: Vec<F::Key>) -> Vec<Result<Option<F::Value>, LoadError>> {
        let outcome = AssertUnwindSafe(self.0.fetch(&keys)).catch_unwind().await;
        match caught(self.name(), outcome) {
            Ok(mut values) => keys.iter().map(|key| Ok(values.remove(key))).collect(),
            Err(error) => vec![Err(error); keys.len()],
        }
    }
}

#[async_trait]
impl<F: GroupFetch> Dispatch for Group<F> {
    type Key = F::Key;
    type Value = Vec<F::Value>;

    fn kind(&self) -> LoaderKind {
        LoaderKind::Group
    }

    fn name(&self) -> String {
        short_type_name::<F>()
    }

    async fn dispatch(&self, keys: Vec<F::Key>) -> Vec<Result<Vec<F::Value>, LoadError>> {
        let outcome = AssertUnwindSafe(self.0.fetch(&keys)).catch_unwind().await;
        match caught(self.name(), outcome) {
            Ok(mut groups) => keys
                .iter()
                .map(|key| Ok(groups.remove(key).unwrap_or_default()))
                .collect(),
            Err(error) => vec![Err(error); keys.len()],
        }
    }
}

#[async_trait]
impl<F: CacheFetch> Dispatch for Cache<F> {
    type Key = F::Key;
    type Value = F::Value;

    fn kind(&self) -> LoaderKind {
        LoaderKind::Cache
    }

    fn name(&self) -> String {
        short_type_name::<F>()
    }

    async fn dispatch(&self, keys: Vec<F::Key>) -> Vec<Result<F::Value, LoadError>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in &keys {
            let outcome = AssertUnwindSafe(self.0.fetch(key)).catch_unwind().await;
            results.push(caught(self.name(), outcome));
        }
        results
    }
}

fn caught<T, E: fmt::Display>(
    loader: String,
    outcome: Result<Result<T, E>, Box<dyn Any + Send>>,
) -> Result<T, LoadError> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(LoadError::fetch(loader, error)),
        Err(payload) => Err(LoadError::Panicked {
            loader,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn short_type_name<T>() -> String {
    let name = std::any::type_name::<T>();
    // Generic parameters would otherwise be cut in the middle
    let base = name.split('<').next().unwrap_or(name);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use maplit::hashmap;
    use pretty_assertions::assert_eq;

    use super::*;

    struct Users;

    #[async_trait]
    impl BatchFetch for Users {
        type Key = u32;
        type Value = String;
        type Error = String;

        async fn fetch(&self, keys: &[u32]) -> Result<HashMap<u32, String>, String> {
            if keys.contains(&0) {
                return Err("user 0 is reserved".to_string());
            }
            Ok(keys
                .iter()
                .filter(|key| **key != 404)
                .map(|key| (*key, format!("user {key}")))
                .collect())
        }
    }

    struct Reviews;

    #[async_trait]
    impl GroupFetch for Reviews {
        type Key = &'static str;
        type Value = u8;
        type Error = String;

        async fn fetch(&self, _keys: &[&'static str]) -> Result<HashMap<&'static str, Vec<u8>>, String> {
            Ok(hashmap! { "book" => vec![5, 3] })
        }
    }

    struct Prices;

    #[async_trait]
    impl CacheFetch for Prices {
        type Key = &'static str;
        type Value = u32;
        type Error = String;

        async fn fetch(&self, key: &&'static str) -> Result<u32, String> {
            match *key {
                "broken" => Err("price service unavailable".to_string()),
                "explosive" => panic!("price overflow"),
                _ => Ok(key.len() as u32),
            }
        }
    }

    #[tokio::test]
    async fn batch_missing_keys_resolve_to_none() {
        let results = Batch(Users).dispatch(vec![1, 404]).await;
        assert_eq!(results, vec![Ok(Some("user 1".to_string())), Ok(None)]);
    }

    #[tokio::test]
    async fn batch_failure_fans_out_to_every_key() {
        let results = Batch(Users).dispatch(vec![0, 1, 2]).await;
        let expected = Err(LoadError::fetch("Users", "user 0 is reserved"));
        assert_eq!(results, vec![expected.clone(), expected.clone(), expected]);
    }

    #[tokio::test]
    async fn group_missing_keys_resolve_to_empty_lists() {
        let results = Group(Reviews).dispatch(vec!["book", "film"]).await;
        assert_eq!(results, vec![Ok(vec![5, 3]), Ok(vec![])]);
    }

    #[tokio::test]
    async fn cache_failures_are_isolated() {
        let results = Cache(Prices)
            .dispatch(vec!["broken", "book", "explosive"])
            .await;
        assert_eq!(
            results,
            vec![
                Err(LoadError::fetch("Prices", "price service unavailable")),
                Ok(4),
                Err(LoadError::Panicked {
                    loader: "Prices".to_string(),
                    message: "price overflow".to_string(),
                }),
            ]
        );
    }

    #[test]
    fn names_and_kinds() {
        assert_eq!(Batch(Users).name(), "Users");
        assert_eq!(Cache(Prices).kind(), LoaderKind::Cache);
        assert_eq!(LoaderKind::Group.to_string(), "group");
        assert_eq!(short_type_name::<Vec<u8>>(), "Vec");
    }
}
