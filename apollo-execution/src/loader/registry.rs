use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::DataLoader;
use super::Dispatch;
use crate::configuration::BatchingConfig;
use crate::error::LoadError;

/// Round control of a loader, independent of its key and value types.
trait PendingRound: Send + Sync {
    fn has_pending(&self) -> bool;
    fn dispatch(&self) -> BoxFuture<'_, usize>;
    fn abort(&self, error: LoadError) -> usize;
}

impl<D: Dispatch> PendingRound for DataLoader<D> {
    fn has_pending(&self) -> bool {
        DataLoader::has_pending(self)
    }

    fn dispatch(&self) -> BoxFuture<'_, usize> {
        self.dispatch_round().boxed()
    }

    fn abort(&self, error: LoadError) -> usize {
        DataLoader::abort(self, error)
    }
}

struct Registered {
    name: String,
    typed: Arc<dyn Any + Send + Sync>,
    round: Arc<dyn PendingRound>,
}

/// The loaders of one operation, one per declared loader type.
#[derive(Default)]
pub struct LoaderRegistry {
    loaders: HashMap<TypeId, Registered>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `loader`, replacing any loader declared with the same type.
    pub fn insert<D: Dispatch>(&mut self, loader: DataLoader<D>) -> Arc<DataLoader<D>> {
        let loader = Arc::new(loader);
        self.loaders.insert(
            TypeId::of::<D>(),
            Registered {
                name: loader.name().to_string(),
                typed: loader.clone(),
                round: loader.clone(),
            },
        );
        loader
    }

    pub fn get<D: Dispatch>(&self) -> Option<Arc<DataLoader<D>>> {
        self.loaders
            .get(&TypeId::of::<D>())?
            .typed
            .clone()
            .downcast::<DataLoader<D>>()
            .ok()
    }

    pub fn has_pending(&self) -> bool {
        self.loaders.values().any(|loader| loader.round.has_pending())
    }

    /// Dispatches the round of every loader with pending keys, concurrently. Returns the
    /// number of keys fetched.
    pub async fn dispatch_all(&self) -> usize {
        let rounds = self
            .loaders
            .values()
            .filter(|loader| loader.round.has_pending())
            .map(|loader| {
                tracing::trace!(loader = %loader.name, "closing loader round");
                loader.round.dispatch()
            });
        futures::future::join_all(rounds).await.into_iter().sum()
    }

    /// Rejects the pending keys of every loader with `error`. Returns the number of keys
    /// rejected.
    pub fn abort_all(&self, error: LoadError) -> usize {
        self.loaders
            .values()
            .map(|loader| loader.round.abort(error.clone()))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.loaders.values().map(|loader| &loader.name))
            .finish()
    }
}

type Factory = Arc<dyn Fn(&BatchingConfig, &mut LoaderRegistry) + Send + Sync>;

/// Declared loaders, instantiated fresh for every operation.
#[derive(Clone, Default)]
pub(crate) struct LoaderFactories {
    factories: Vec<Factory>,
}

impl LoaderFactories {
    pub(crate) fn register<D, F>(&mut self, factory: F)
    where
        D: Dispatch,
        F: Fn() -> D + Send + Sync + 'static,
    {
        self.factories.push(Arc::new(move |config, registry| {
            registry.insert(DataLoader::with_config(factory(), config));
        }));
    }

    pub(crate) fn instantiate(&self, config: &BatchingConfig) -> LoaderRegistry {
        let mut registry = LoaderRegistry::new();
        for factory in &self.factories {
            factory(config, &mut registry);
        }
        registry
    }

    pub(crate) fn len(&self) -> usize {
        self.factories.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::loader::Batch;
    use crate::loader::BatchFetch;
    use crate::loader::Cache;
    use crate::loader::CacheFetch;

    struct Doubles;

    #[async_trait]
    impl BatchFetch for Doubles {
        type Key = u64;
        type Value = u64;
        type Error = String;

        async fn fetch(&self, keys: &[u64]) -> Result<HashMap<u64, u64>, String> {
            Ok(keys.iter().map(|key| (*key, key * 2)).collect())
        }
    }

    struct Lengths;

    #[async_trait]
    impl CacheFetch for Lengths {
        type Key = String;
        type Value = usize;
        type Error = String;

        async fn fetch(&self, key: &String) -> Result<usize, String> {
            Ok(key.len())
        }
    }

    #[tokio::test]
    async fn loaders_are_looked_up_by_type() {
        let mut factories = LoaderFactories::default();
        factories.register(|| Batch(Doubles));
        factories.register(|| Cache(Lengths));
        assert_eq!(factories.len(), 2);

        let registry = factories.instantiate(&BatchingConfig::default());
        assert_eq!(registry.len(), 2);
        let doubles = registry.get::<Batch<Doubles>>().unwrap();
        let lengths = registry.get::<Cache<Lengths>>().unwrap();
        assert!(registry.get::<Batch<Lengths>>().is_none());

        let double = doubles.load(21);
        let length = lengths.load("hello".to_string());
        assert!(registry.has_pending());
        assert_eq!(registry.dispatch_all().await, 2);
        assert!(!registry.has_pending());

        assert_eq!(double.await, Ok(Some(42)));
        assert_eq!(length.await, Ok(5));
    }

    #[tokio::test]
    async fn abort_all_rejects_every_loader() {
        let mut registry = LoaderRegistry::new();
        let doubles = registry.insert(DataLoader::new(Batch(Doubles)));
        let lengths = registry.insert(DataLoader::new(Cache(Lengths)));
        let double = doubles.load(1);
        let length = lengths.load("a".to_string());

        assert_eq!(registry.abort_all(LoadError::Cancelled), 2);
        assert_eq!(double.await, Err(LoadError::Cancelled));
        assert_eq!(length.await, Err(LoadError::Cancelled));
        assert_eq!(registry.dispatch_all().await, 0);
    }

    #[test]
    fn each_instantiation_is_fresh() {
        let mut factories = LoaderFactories::default();
        factories.register(|| Batch(Doubles));
        let first = factories.instantiate(&BatchingConfig::default());
        let second = factories.instantiate(&BatchingConfig::default());
        let _pending = first.get::<Batch<Doubles>>().unwrap().load(1);
        assert!(first.has_pending());
        assert!(!second.has_pending());
    }
}
