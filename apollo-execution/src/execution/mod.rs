//! Execution of one operation: root tasks in, errors and task outcomes out.
//!
//! The executor alternates between two phases until no task is left. First it starts every
//! task the queue hands out and waits for the scheduler to go idle. Then, when nothing else can
//! run, it closes the round of every loader with pending keys; the fetched results wake the
//! suspended resolvers, which may queue child tasks in turn. A resolver woken up by anything
//! else, such as a timer, is noticed when the scheduler goes idle again.

mod context;

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use self::context::OperationContext;
use crate::configuration::Configuration;
use crate::error::ExecutionError;
use crate::error::FieldError;
use crate::error::LoadError;
use crate::error::SchedulerError;
use crate::graphql;
use crate::json_ext::Path;
use crate::loader::DataLoader;
use crate::loader::Dispatch;
use crate::loader::LoaderFactories;
use crate::loader::LoaderRegistry;
use crate::queue::ExecutionQueue;
use crate::queue::QueueDiagnostics;
use crate::scheduler::TrackableScheduler;
use crate::task::ExecutionTask;
use crate::task::TaskKind;
use crate::task::TaskPool;

/// The outcome of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// Errors reported by resolvers, in the order they were reported.
    pub errors: Vec<graphql::Error>,
    /// Number of tasks that completed normally.
    pub completed: usize,
    /// Number of tasks that faulted, including the silently cancelled ones.
    pub faulted: usize,
    /// Whether the operation was cancelled before all of its tasks ran.
    pub cancelled: bool,
}

/// Produces the root tasks of an operation, typically one per root field selection.
pub trait RootTaskProvider: Send + Sync {
    fn root_tasks(&self, context: &ResolverContext) -> Vec<ExecutionTask>;
}

impl<F> RootTaskProvider for F
where
    F: Fn(&ResolverContext) -> Vec<ExecutionTask> + Send + Sync,
{
    fn root_tasks(&self, context: &ResolverContext) -> Vec<ExecutionTask> {
        self(context)
    }
}

/// Handed to resolvers: cancellation, loaders and creation of child tasks.
#[derive(Clone)]
pub struct ResolverContext {
    inner: Arc<ResolverState>,
}

struct ResolverState {
    operation: Arc<OperationContext>,
    queue: Arc<ExecutionQueue>,
    loaders: LoaderRegistry,
    pool: Arc<TaskPool>,
    aborted: CancellationToken,
}

impl ResolverContext {
    /// The cancellation token of the operation.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.aborted
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.aborted.is_cancelled()
    }

    /// Fails with [`ExecutionError::Cancelled`] once the operation was cancelled, so resolvers
    /// can bail out with `?` between suspension points.
    pub fn check_cancelled(&self) -> Result<(), ExecutionError> {
        if self.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The loader declared with type `D`.
    pub fn loader<D: Dispatch>(&self) -> Result<Arc<DataLoader<D>>, ExecutionError> {
        self.inner
            .loaders
            .get::<D>()
            .ok_or_else(|| ExecutionError::LoaderNotRegistered {
                loader: std::any::type_name::<D>().to_string(),
            })
    }

    /// Loads `key` with the loader declared with type `D`.
    pub async fn load<D: Dispatch>(&self, key: D::Key) -> Result<D::Value, FieldError> {
        let loader = self.loader::<D>()?;
        Ok(loader.load(key).await?)
    }

    /// Creates a task running `resolver`. The task does not run until it is
    /// [spawned](ResolverContext::spawn).
    pub fn task<F, Fut>(&self, kind: TaskKind, path: Path, resolver: F) -> ExecutionTask
    where
        F: FnOnce(ResolverContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FieldError>> + Send + 'static,
    {
        let context = self.clone();
        self.inner
            .pool
            .rent(kind, path, move || resolver(context))
    }

    pub fn parallel<F, Fut>(&self, path: Path, resolver: F) -> ExecutionTask
    where
        F: FnOnce(ResolverContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FieldError>> + Send + 'static,
    {
        self.task(TaskKind::Parallel, path, resolver)
    }

    pub fn serial<F, Fut>(&self, path: Path, resolver: F) -> ExecutionTask
    where
        F: FnOnce(ResolverContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FieldError>> + Send + 'static,
    {
        self.task(TaskKind::Serial, path, resolver)
    }

    /// Queues `task` for execution. Returns false if it is queued already.
    pub fn spawn(&self, task: &ExecutionTask) -> bool {
        let queued = self.inner.queue.enqueue(task);
        if queued {
            self.inner.operation.notify();
        }
        queued
    }

    /// Resolvers that started and did not return yet, including the suspended ones.
    pub fn running_resolvers(&self) -> usize {
        self.inner.operation.running()
    }

    pub fn queue_diagnostics(&self) -> QueueDiagnostics {
        self.inner.queue.diagnostics()
    }
}

impl std::fmt::Debug for ResolverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverContext")
            .field("loaders", &self.inner.loaders)
            .field("queue", &self.inner.queue.diagnostics())
            .field("running_resolvers", &self.running_resolvers())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Executes operations with a set of declared loaders.
pub struct OperationExecutor {
    configuration: Arc<Configuration>,
    loaders: LoaderFactories,
    pool: Arc<TaskPool>,
}

impl OperationExecutor {
    pub fn new(configuration: Configuration) -> Self {
        let pool = Arc::new(TaskPool::new(configuration.task_pool().capacity()));
        Self {
            configuration: Arc::new(configuration),
            loaders: LoaderFactories::default(),
            pool,
        }
    }

    /// Declares a loader. `factory` creates a fresh instance for every operation.
    pub fn register_loader<D, F>(&mut self, factory: F) -> &mut Self
    where
        D: Dispatch,
        F: Fn() -> D + Send + Sync + 'static,
    {
        self.loaders.register(factory);
        self
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Idle tasks kept for reuse by later operations.
    pub fn task_pool(&self) -> &TaskPool {
        &self.pool
    }

    /// Runs the tasks of `provider` and every task they spawn until none is left.
    ///
    /// Cancelling `cancellation` stops the operation cooperatively: tasks that did not start
    /// yet fault without reporting errors, and pending loads fail with
    /// [`LoadError::Cancelled`].
    pub async fn execute(
        &self,
        provider: &dyn RootTaskProvider,
        cancellation: Option<&CancellationToken>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let span = tracing::info_span!(
            "execute_operation",
            "otel.kind" = "INTERNAL",
            loaders = self.loaders.len(),
        );
        self.run(provider, cancellation).instrument(span).await
    }

    async fn run(
        &self,
        provider: &dyn RootTaskProvider,
        cancellation: Option<&CancellationToken>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let aborted = cancellation
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let scheduler = TrackableScheduler::new(self.configuration.scheduler())?;
        let poll_timeout = self.configuration.scheduler().poll_timeout();
        let queue = Arc::new(ExecutionQueue::new());
        let operation = Arc::new(OperationContext::new(aborted.clone(), queue.clone()));
        let context = ResolverContext {
            inner: Arc::new(ResolverState {
                operation: operation.clone(),
                queue: queue.clone(),
                loaders: self.loaders.instantiate(self.configuration.batching()),
                pool: self.pool.clone(),
                aborted: aborted.clone(),
            }),
        };

        for task in provider.root_tasks(&context) {
            if !queue.enqueue(&task) {
                tracing::warn!(path = %task.path(), "root task was provided twice");
            }
        }

        let mut cancelled = false;
        let mut rounds = 0usize;
        loop {
            while let Some(task) = queue.try_dequeue_next() {
                operation.begin(task, &scheduler);
            }
            if queue.is_empty() && operation.unfinished() == 0 {
                break;
            }

            let token = (!cancelled).then_some(&aborted);
            match scheduler.wait_till_idle(token).await {
                Ok(()) | Err(SchedulerError::Cancelled) => {}
                Err(error) => return Err(error.into()),
            }
            // Read before looking at the loaders, so a resolver that is woken up afterwards and
            // suspends on a load is seen by the wait below
            let transitions = scheduler.idle_transitions();

            if aborted.is_cancelled() {
                if !cancelled {
                    tracing::debug!(
                        unfinished = operation.unfinished(),
                        "operation cancelled, rejecting pending loads"
                    );
                    cancelled = true;
                }
                context.inner.loaders.abort_all(LoadError::Cancelled);
            } else if !queue.has_ready() {
                // Nothing else can run: this is when the round holds the most keys
                let keys = context.inner.loaders.dispatch_all().await;
                if keys > 0 {
                    rounds += 1;
                    tracing::trace!(
                        keys,
                        running = operation.running(),
                        "loader round dispatched"
                    );
                    continue;
                }
            }
            if queue.has_ready() {
                continue;
            }

            // Wait for a task to finish, spawn children or suspend again after being woken up by
            // something other than a loader. The timeout only guards liveness.
            tokio::select! {
                _ = operation.changed() => {}
                _ = scheduler.wait_idle_transition(transitions) => {}
                _ = aborted.cancelled(), if !cancelled => {}
                _ = tokio::time::sleep(poll_timeout) => {}
            }
        }

        scheduler.complete();
        let result = ExecutionResult {
            errors: operation.take_errors(),
            completed: operation.completed_count(),
            faulted: operation.faulted_count(),
            cancelled: aborted.is_cancelled(),
        };

        drop(context);
        let started = operation.take_started();
        let total = started.len();
        let recycled = started
            .into_iter()
            .map(|task| self.pool.recycle(task))
            .filter(|kept| *kept)
            .count();
        tracing::debug!(
            tasks = total,
            recycled,
            rounds,
            errors = result.errors.len(),
            "operation executed"
        );

        Ok(result)
    }
}

impl std::fmt::Debug for OperationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationExecutor")
            .field("configuration", &self.configuration)
            .field("loaders", &self.loaders.len())
            .field("pooled_tasks", &self.pool.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use test_log::test;

    use super::*;
    use crate::configuration::SchedulerConfig;
    use crate::loader::Batch;
    use crate::loader::BatchFetch;

    fn executor() -> OperationExecutor {
        OperationExecutor::new(
            Configuration::builder()
                .scheduler(SchedulerConfig::builder().processors(2).build())
                .build()
                .unwrap(),
        )
    }

    struct Squares {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BatchFetch for Squares {
        type Key = u64;
        type Value = u64;
        type Error = String;

        async fn fetch(&self, keys: &[u64]) -> Result<HashMap<u64, u64>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(keys.iter().map(|key| (*key, key * key)).collect())
        }
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn empty_operations_finish() {
        let result = executor()
            .execute(&|_: &ResolverContext| Vec::<ExecutionTask>::new(), None)
            .await
            .unwrap();
        assert_eq!(result, ExecutionResult::default());
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn nested_tasks_run_to_completion() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let provider = {
            let seen = seen.clone();
            move |context: &ResolverContext| {
                let seen = seen.clone();
                vec![context.parallel(Path::from("/hero"), move |context| async move {
                    seen.lock().push("hero".to_string());
                    for index in 0..3 {
                        let seen = seen.clone();
                        let child = context.parallel(
                            Path::from("/hero/friends").index(index),
                            move |_| async move {
                                seen.lock().push(format!("friend {index}"));
                                Ok(())
                            },
                        );
                        context.spawn(&child);
                    }
                    Ok(())
                })]
            }
        };

        let result = executor().execute(&provider, None).await.unwrap();
        assert_eq!(result.completed, 4);
        assert_eq!(result.faulted, 0);
        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["friend 0", "friend 1", "friend 2", "hero"]);
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn loads_of_one_wave_share_a_round() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut executor = executor();
        let factory_calls = calls.clone();
        executor.register_loader(move || {
            Batch(Squares {
                calls: factory_calls.clone(),
            })
        });

        let sum = Arc::new(AtomicUsize::new(0));
        let provider = {
            let sum = sum.clone();
            move |context: &ResolverContext| {
                (1..=4u64)
                    .map(|key| {
                        let sum = sum.clone();
                        context.parallel(Path::empty().key(format!("n{key}")), move |context| {
                            async move {
                                let square = context.load::<Batch<Squares>>(key).await?;
                                sum.fetch_add(square.unwrap_or_default() as usize, Ordering::SeqCst);
                                Ok(())
                            }
                        })
                    })
                    .collect()
            }
        };

        let result = executor.execute(&provider, None).await.unwrap();
        assert_eq!(result.completed, 4);
        assert_eq!(sum.load(Ordering::SeqCst), 1 + 4 + 9 + 16);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn suspended_resolvers_count_as_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut executor = executor();
        executor.register_loader({
            let calls = calls.clone();
            move || {
                Batch(Squares {
                    calls: calls.clone(),
                })
            }
        });
        let observed = Arc::new(Mutex::new(Vec::new()));
        let provider = {
            let observed = observed.clone();
            move |context: &ResolverContext| {
                (1..=2u64)
                    .map(|key| {
                        let observed = observed.clone();
                        context.parallel(Path::empty().index(key as usize), move |context| {
                            async move {
                                context.load::<Batch<Squares>>(key).await?;
                                // Counts itself, and the other one unless it returned already
                                observed.lock().push(context.running_resolvers());
                                Ok(())
                            }
                        })
                    })
                    .collect()
            }
        };

        let result = executor.execute(&provider, None).await.unwrap();
        assert_eq!(result.completed, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let observed = observed.lock().clone();
        assert_eq!(observed.len(), 2);
        assert!(observed.iter().all(|running| (1..=2).contains(running)));
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn missing_loader_is_a_field_error() {
        let provider = |context: &ResolverContext| {
            vec![context.parallel(Path::from("/square"), |context| async move {
                context.load::<Batch<Squares>>(3).await?;
                Ok(())
            })]
        };
        let result = executor().execute(&provider, None).await.unwrap();
        assert_eq!(result.faulted, 1);
        assert_eq!(
            result.errors[0].extension_code().as_deref(),
            Some("LOADER_NOT_REGISTERED")
        );
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn tasks_are_recycled_across_operations() {
        let executor = executor();
        let pool = executor.task_pool();
        let idle_after_renting = Arc::new(AtomicUsize::new(usize::MAX));
        let provider = {
            let idle_after_renting = idle_after_renting.clone();
            move |context: &ResolverContext| {
                let tasks: Vec<_> = (0..3)
                    .map(|index| {
                        context.parallel(Path::empty().index(index), |_| async { Ok(()) })
                    })
                    .collect();
                idle_after_renting.store(pool.len(), Ordering::SeqCst);
                tasks
            }
        };

        let result = executor.execute(&provider, None).await.unwrap();
        assert_eq!(result.completed, 3);
        assert_eq!(idle_after_renting.load(Ordering::SeqCst), 0);
        assert_eq!(executor.task_pool().len(), 3);

        // The second operation runs entirely on recycled tasks
        let result = executor.execute(&provider, None).await.unwrap();
        assert_eq!(result.completed, 3);
        assert_eq!(idle_after_renting.load(Ordering::SeqCst), 0);
        assert_eq!(executor.task_pool().len(), 3);
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn cancelled_operations_report_no_errors() {
        let token = CancellationToken::new();
        token.cancel();
        let provider = |context: &ResolverContext| {
            vec![context.parallel(Path::from("/a"), |_| async {
                Err(FieldError::new("never reported"))
            })]
        };
        let result = executor().execute(&provider, Some(&token)).await.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.faulted, 1);
        assert!(result.errors.is_empty());
    }
}
