//! Execution tasks: one unit of resolver work and its completion status.

mod context;
mod pool;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

pub use self::context::InFlight;
#[cfg(test)]
pub(crate) use self::context::MockTaskContext;
pub use self::context::TaskContext;
pub use self::context::TrackScope;
pub use self::pool::TaskPool;
use crate::error::FieldError;
use crate::json_ext::Path;
use crate::scheduler::TrackableScheduler;

type Work = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), FieldError>> + Send>;

/// Status of an [`ExecutionTask`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    WaitingToRun,
    Running,
    Completed,
    Faulted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Faulted)
    }
}

/// Which lane of the [`ExecutionQueue`](crate::ExecutionQueue) a task runs in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// May run concurrently with any other task.
    #[default]
    Parallel,
    /// Runs one at a time, in submission order. Used for mutation root fields.
    Serial,
}

/// A unit of resolver work.
///
/// This is a cheap handle: clones refer to the same task. A task runs its work once, after
/// which it can be [`reset`](ExecutionTask::reset) and reused.
#[derive(Clone)]
pub struct ExecutionTask {
    core: Arc<TaskCore>,
}

struct TaskCore {
    kind: Mutex<TaskKind>,
    path: Mutex<Path>,
    /// Opaque data owned by whoever created the task
    state: Mutex<Option<Box<dyn Any + Send>>>,
    work: Mutex<Option<Work>>,
    is_serial: AtomicBool,
    /// Set while the task is linked into an execution queue
    is_registered: AtomicBool,
    faulted: AtomicBool,
    status: watch::Sender<TaskStatus>,
}

impl ExecutionTask {
    pub fn new<F, Fut>(kind: TaskKind, path: Path, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FieldError>> + Send + 'static,
    {
        let (status, _) = watch::channel(TaskStatus::WaitingToRun);
        Self {
            core: Arc::new(TaskCore {
                kind: Mutex::new(kind),
                path: Mutex::new(path),
                state: Mutex::new(None),
                work: Mutex::new(Some(Self::box_work(work))),
                is_serial: AtomicBool::new(false),
                is_registered: AtomicBool::new(false),
                faulted: AtomicBool::new(false),
                status,
            }),
        }
    }

    pub fn parallel<F, Fut>(path: Path, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FieldError>> + Send + 'static,
    {
        Self::new(TaskKind::Parallel, path, work)
    }

    pub fn serial<F, Fut>(path: Path, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FieldError>> + Send + 'static,
    {
        Self::new(TaskKind::Serial, path, work)
    }

    fn box_work<F, Fut>(work: F) -> Work
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FieldError>> + Send + 'static,
    {
        Box::new(move || work().boxed())
    }

    pub fn status(&self) -> TaskStatus {
        *self.core.status.borrow()
    }

    pub fn kind(&self) -> TaskKind {
        *self.core.kind.lock()
    }

    /// The path of the response field this task resolves.
    pub fn path(&self) -> Path {
        self.core.path.lock().clone()
    }

    /// True if the task runs in the serial lane, either because of its kind or because it
    /// was flagged with [`set_serial`](ExecutionTask::set_serial).
    pub fn is_serial(&self) -> bool {
        self.kind() == TaskKind::Serial || self.core.is_serial.load(Ordering::SeqCst)
    }

    /// Forces a parallel task into the serial lane, e.g. for resolvers that mutate shared state.
    pub fn set_serial(&self, serial: bool) {
        self.core.is_serial.store(serial, Ordering::SeqCst);
    }

    pub fn is_registered(&self) -> bool {
        self.core.is_registered.load(Ordering::SeqCst)
    }

    /// Returns false if the task was registered already.
    pub(crate) fn register(&self) -> bool {
        !self.core.is_registered.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn unregister(&self) {
        self.core.is_registered.store(false, Ordering::SeqCst);
    }

    pub fn set_state<T: Any + Send>(&self, state: T) {
        *self.core.state.lock() = Some(Box::new(state));
    }

    /// Takes the state slot if it holds a `T`.
    pub fn take_state<T: Any + Send>(&self) -> Option<T> {
        let mut slot = self.core.state.lock();
        match slot.take()?.downcast::<T>() {
            Ok(state) => Some(*state),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }

    /// True if both handles refer to the same task.
    pub fn ptr_eq(&self, other: &ExecutionTask) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub(crate) fn strong_count(&self) -> usize {
        Arc::strong_count(&self.core)
    }

    /// Marks the task as faulted. Only ever turns a `Completed` status into `Faulted`.
    pub fn faulted(&self) {
        self.core.faulted.store(true, Ordering::SeqCst);
        self.core.status.send_if_modified(|status| {
            if *status == TaskStatus::Completed {
                *status = TaskStatus::Faulted;
                true
            } else {
                false
            }
        });
    }

    /// Submits the work of this task to `scheduler` and returns without waiting for it.
    ///
    /// Returns false if the task was started already.
    pub fn begin_execute(
        &self,
        scheduler: &TrackableScheduler,
        context: Arc<dyn TaskContext>,
    ) -> bool {
        let started = self.core.status.send_if_modified(|status| {
            if *status == TaskStatus::WaitingToRun {
                *status = TaskStatus::Running;
                true
            } else {
                false
            }
        });
        if !started {
            failfast_debug!(path = %self.path(), "task was started more than once");
            return false;
        }

        let task = self.clone();
        let mut completion = Completion {
            task: Some(self.clone()),
            context,
        };
        let _ = scheduler.schedule(async move {
            let succeeded = task.execute(completion.context.as_ref()).await;
            drop(task);
            completion.finish(succeeded);
        });
        true
    }

    async fn execute(&self, context: &dyn TaskContext) -> bool {
        let work = self.core.work.lock().take();
        let aborted = context.request_aborted();
        if aborted.is_cancelled() {
            return false;
        }
        let Some(work) = work else {
            return true;
        };

        let _scope = context.track(self);
        let outcome = AssertUnwindSafe(async move { work().await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(FieldError::from_panic(payload)));

        match outcome {
            Ok(()) => true,
            Err(error) if error.is_cancellation() => false,
            Err(error) => {
                // Errors raised while the operation is torn down are noise
                if !aborted.is_cancelled() {
                    context.report_error(self, error);
                }
                false
            }
        }
    }

    fn finish(&self, succeeded: bool) {
        self.core.status.send_modify(|status| {
            *status = if succeeded && !self.core.faulted.load(Ordering::SeqCst) {
                TaskStatus::Completed
            } else {
                self.core.faulted.store(true, Ordering::SeqCst);
                TaskStatus::Faulted
            };
        });
    }

    /// Resolves with the terminal status once the work of this task has returned, normally
    /// or not. Resolves immediately for a task that was never started.
    pub fn wait_for_completion(&self) -> impl Future<Output = TaskStatus> + Send + 'static {
        let mut status = self.core.status.subscribe();
        async move {
            let current = *status.borrow_and_update();
            if current == TaskStatus::WaitingToRun || current.is_terminal() {
                return current;
            }
            match status.wait_for(|status| status.is_terminal()).await {
                Ok(terminal) => *terminal,
                Err(_) => TaskStatus::Faulted,
            }
        }
    }

    /// Clears the task so it can be reused. Must not be called while the task is running.
    pub fn reset(&self) {
        *self.core.kind.lock() = TaskKind::default();
        *self.core.path.lock() = Path::empty();
        self.core.state.lock().take();
        self.core.work.lock().take();
        self.core.is_serial.store(false, Ordering::SeqCst);
        self.core.is_registered.store(false, Ordering::SeqCst);
        self.core.faulted.store(false, Ordering::SeqCst);
        self.core.status.send_replace(TaskStatus::WaitingToRun);
    }

    /// Loads new work into a reset task.
    pub(crate) fn prepare<F, Fut>(&self, kind: TaskKind, path: Path, work: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FieldError>> + Send + 'static,
    {
        *self.core.kind.lock() = kind;
        *self.core.path.lock() = path;
        *self.core.work.lock() = Some(Self::box_work(work));
    }
}

impl fmt::Debug for ExecutionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionTask")
            .field("kind", &self.kind())
            .field("status", &self.status())
            .field("path", &self.path())
            .field("is_serial", &self.is_serial())
            .field("is_registered", &self.is_registered())
            .finish()
    }
}

/// Publishes the final status of a task, even when its scheduled work is dropped unfinished.
struct Completion {
    /// Taken once the final status is published
    task: Option<ExecutionTask>,
    context: Arc<dyn TaskContext>,
}

impl Completion {
    fn finish(&mut self, succeeded: bool) {
        if let Some(task) = self.task.take() {
            task.finish(succeeded);
            self.context.completed(task);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.finish(false);
    }
}
