use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;

use super::ExecutionTask;
use crate::error::FieldError;

/// What a task needs from the operation executing it.
#[cfg_attr(test, mockall::automock)]
pub trait TaskContext: Send + Sync {
    /// The cancellation token of the whole operation.
    fn request_aborted(&self) -> CancellationToken;

    /// Attaches `error` to the response at the path of `task`.
    fn report_error(&self, task: &ExecutionTask, error: FieldError);

    /// Marks `task` as running until the returned scope is dropped.
    ///
    /// The count this feeds is for diagnostics only. Idle detection relies on the in-flight
    /// count of the scheduler.
    fn track(&self, task: &ExecutionTask) -> TrackScope;

    /// Called once after `task` reached a terminal status. The executing side holds no other
    /// handle to the task by then.
    fn completed(&self, task: ExecutionTask);
}

/// Counts the tasks that are executing resolver code, including while suspended.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    count: Arc<AtomicUsize>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn enter(&self) -> TrackScope {
        self.count.fetch_add(1, Ordering::SeqCst);
        TrackScope {
            count: Some(self.count.clone()),
        }
    }
}

/// Decrements its [`InFlight`] counter when dropped.
#[derive(Debug)]
#[must_use = "the task is only tracked while the scope is alive"]
pub struct TrackScope {
    count: Option<Arc<AtomicUsize>>,
}

impl TrackScope {
    /// A scope that tracks nothing.
    pub fn untracked() -> Self {
        Self { count: None }
    }
}

impl Drop for TrackScope {
    fn drop(&mut self) {
        if let Some(count) = self.count.take() {
            let _ = count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }
}
