//! Batch loading coordination.
//!
//! A [`DataLoader`] collects the keys requested while a wave of tasks runs. When the scheduler
//! reports that no task can make progress, the executor closes the round: the collected keys
//! are fetched together and each waiting caller receives the result for its key.

mod kinds;
mod registry;

use std::collections::HashMap;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::JoinAll;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing_futures::Instrument;

pub use self::kinds::Batch;
pub use self::kinds::BatchFetch;
pub use self::kinds::Cache;
pub use self::kinds::CacheFetch;
pub use self::kinds::Dispatch;
pub use self::kinds::Group;
pub use self::kinds::GroupFetch;
pub use self::kinds::LoaderKey;
pub use self::kinds::LoaderKind;
pub use self::kinds::LoaderValue;
pub(crate) use self::registry::LoaderFactories;
pub use self::registry::LoaderRegistry;
use crate::configuration::BatchingConfig;
use crate::error::LoadError;

/// The result of loading one key.
pub type LoadResult<V> = Result<V, LoadError>;

/// Resolves once the round holding the key was dispatched.
pub type LoadFuture<V> = BoxFuture<'static, LoadResult<V>>;

type Waiters<K, V> = IndexMap<K, Vec<oneshot::Sender<LoadResult<V>>>>;

/// Where a loader is in its round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    /// Accepting keys for the next fetch.
    Collecting,
    /// The keys of the round are being fetched. New keys go to the next round.
    Dispatching,
    /// Results are being handed to the waiters.
    Distributing,
}

/// Coordinates the loads of one declared loader during one operation.
pub struct DataLoader<D: Dispatch> {
    dispatcher: D,
    name: String,
    max_batch_size: Option<usize>,
    round: Mutex<Round<D::Key, D::Value>>,
    cache: Option<Mutex<HashMap<D::Key, D::Value>>>,
}

struct Round<K, V> {
    state: RoundState,
    /// Every caller waiting on a key, keys kept in request order
    waiters: Waiters<K, V>,
}

impl<D: Dispatch> DataLoader<D> {
    /// A loader without result cache that fetches each round in a single call.
    pub fn new(dispatcher: D) -> Self {
        Self::with_config(dispatcher, &BatchingConfig::default())
    }

    pub fn with_config(dispatcher: D, config: &BatchingConfig) -> Self {
        Self {
            name: dispatcher.name(),
            dispatcher,
            max_batch_size: config.max_batch_size(),
            round: Mutex::new(Round {
                state: RoundState::Collecting,
                waiters: IndexMap::new(),
            }),
            cache: config.cache().then(|| Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> LoaderKind {
        self.dispatcher.kind()
    }

    /// Requests `key`. The returned future resolves after the round holding the key has been
    /// dispatched. Requesting a key that is already pending joins the pending request.
    pub fn load(&self, key: D::Key) -> LoadFuture<D::Value> {
        if let Some(cache) = &self.cache {
            if let Some(value) = cache.lock().get(&key) {
                return futures::future::ready(Ok(value.clone())).boxed();
            }
        }

        let (tx, rx) = oneshot::channel();
        self.round.lock().waiters.entry(key).or_default().push(tx);
        async move { rx.await.unwrap_or(Err(LoadError::Abandoned)) }.boxed()
    }

    /// Requests every key of `keys`; results are in the same order.
    pub fn load_many(
        &self,
        keys: impl IntoIterator<Item = D::Key>,
    ) -> JoinAll<LoadFuture<D::Value>> {
        futures::future::join_all(keys.into_iter().map(|key| self.load(key)))
    }

    pub fn round_state(&self) -> RoundState {
        self.round.lock().state
    }

    /// Keys waiting for the next dispatch, in request order.
    pub fn pending_keys(&self) -> Vec<D::Key> {
        self.round.lock().waiters.keys().cloned().collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.round.lock().waiters.is_empty()
    }

    /// Closes the current round and fetches its keys. Returns the number of keys fetched.
    ///
    /// Does nothing if no key is pending or if a round is being dispatched already.
    pub async fn dispatch_round(&self) -> usize {
        let waiters = {
            let mut round = self.round.lock();
            if round.state != RoundState::Collecting || round.waiters.is_empty() {
                return 0;
            }
            round.state = RoundState::Dispatching;
            std::mem::take(&mut round.waiters)
        };
        let _reopen = Reopen(&self.round);

        let keys: Vec<D::Key> = waiters.keys().cloned().collect();
        let count = keys.len();
        let span = tracing::info_span!(
            "loader_dispatch",
            "otel.kind" = "INTERNAL",
            loader = %self.name,
            kind = %self.kind(),
            keys = count,
        );
        let results = self.fetch(keys).instrument(span).await;

        self.round.lock().state = RoundState::Distributing;
        for ((key, senders), result) in waiters.into_iter().zip(results) {
            if let (Some(cache), Ok(value)) = (&self.cache, &result) {
                cache.lock().insert(key, value.clone());
            }
            for sender in senders {
                // The caller may have stopped waiting
                let _ = sender.send(result.clone());
            }
        }
        count
    }

    async fn fetch(&self, keys: Vec<D::Key>) -> Vec<LoadResult<D::Value>> {
        let chunk_size = self.max_batch_size.unwrap_or(keys.len()).max(1);
        let chunks = keys.chunks(chunk_size).map(|chunk| async move {
            let mut results = self.dispatcher.dispatch(chunk.to_vec()).await;
            if results.len() != chunk.len() {
                failfast_error!(
                    loader = %self.name,
                    expected = chunk.len(),
                    actual = results.len(),
                    "loader returned a result count that does not match its keys"
                );
                results.resize_with(chunk.len(), || {
                    Err(LoadError::fetch(
                        self.name.clone(),
                        "no result was returned for this key",
                    ))
                });
            }
            results
        });
        futures::future::join_all(chunks)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Rejects every pending key with `error`. Returns the number of keys rejected.
    pub fn abort(&self, error: LoadError) -> usize {
        let waiters = std::mem::take(&mut self.round.lock().waiters);
        let count = waiters.len();
        for sender in waiters.into_values().flatten() {
            let _ = sender.send(Err(error.clone()));
        }
        count
    }
}

impl<D: Dispatch> std::fmt::Debug for DataLoader<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let round = self.round.lock();
        f.debug_struct("DataLoader")
            .field("name", &self.name)
            .field("state", &round.state)
            .field("pending", &round.waiters.len())
            .field("cached", &self.cache.as_ref().map(|cache| cache.lock().len()))
            .finish()
    }
}

/// Opens the next round, also when a dispatch is dropped before it finished.
struct Reopen<'a, K, V>(&'a Mutex<Round<K, V>>);

impl<K, V> Drop for Reopen<'_, K, V> {
    fn drop(&mut self) {
        self.0.lock().state = RoundState::Collecting;
    }
}
