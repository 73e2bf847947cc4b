use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::FieldError;
use crate::graphql;
use crate::queue::ExecutionQueue;
use crate::scheduler::TrackableScheduler;
use crate::task::ExecutionTask;
use crate::task::InFlight;
use crate::task::TaskContext;
use crate::task::TaskStatus;
use crate::task::TrackScope;

/// The bookkeeping of one operation, shared by all of its tasks.
pub(crate) struct OperationContext {
    aborted: CancellationToken,
    queue: Arc<ExecutionQueue>,
    errors: Mutex<Vec<graphql::Error>>,
    running: InFlight,
    /// Tasks that were started and did not reach a terminal status yet
    unfinished: AtomicUsize,
    completed: AtomicUsize,
    faulted: AtomicUsize,
    started: Mutex<Vec<ExecutionTask>>,
    /// Signalled when a task finishes or new tasks are queued
    changed: Notify,
}

impl OperationContext {
    pub(crate) fn new(aborted: CancellationToken, queue: Arc<ExecutionQueue>) -> Self {
        Self {
            aborted,
            queue,
            errors: Default::default(),
            running: InFlight::new(),
            unfinished: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            faulted: AtomicUsize::new(0),
            started: Default::default(),
            changed: Notify::new(),
        }
    }

    /// Starts `task` on `scheduler`.
    pub(crate) fn begin(self: &Arc<Self>, task: ExecutionTask, scheduler: &TrackableScheduler) {
        // Counted first, the task may finish before `begin_execute` returns
        self.unfinished.fetch_add(1, Ordering::SeqCst);
        if task.begin_execute(scheduler, self.clone()) {
            self.started.lock().push(task);
        } else {
            self.queue.mark_completed(&task);
            self.decrement_unfinished();
        }
    }

    pub(crate) fn unfinished(&self) -> usize {
        self.unfinished.load(Ordering::SeqCst)
    }

    pub(crate) fn running(&self) -> usize {
        self.running.get()
    }

    pub(crate) fn notify(&self) {
        self.changed.notify_one();
    }

    /// Resolves after the next [`notify`](OperationContext::notify), or right away if one
    /// happened since the last wait.
    pub(crate) async fn changed(&self) {
        self.changed.notified().await
    }

    pub(crate) fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn faulted_count(&self) -> usize {
        self.faulted.load(Ordering::SeqCst)
    }

    pub(crate) fn take_errors(&self) -> Vec<graphql::Error> {
        std::mem::take(&mut *self.errors.lock())
    }

    pub(crate) fn take_started(&self) -> Vec<ExecutionTask> {
        std::mem::take(&mut *self.started.lock())
    }

    fn decrement_unfinished(&self) {
        let previous = self
            .unfinished
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous.is_err() {
            failfast_error!("a task completed more often than it was started");
        }
    }
}

impl TaskContext for OperationContext {
    fn request_aborted(&self) -> CancellationToken {
        self.aborted.clone()
    }

    fn report_error(&self, task: &ExecutionTask, error: FieldError) {
        let path = task.path();
        tracing::debug!(path = %path, error = %error, "resolver failed");
        let path = (!path.is_empty()).then_some(path);
        self.errors.lock().push(error.to_graphql_error(path));
    }

    fn track(&self, _task: &ExecutionTask) -> TrackScope {
        self.running.enter()
    }

    fn completed(&self, task: ExecutionTask) {
        self.queue.mark_completed(&task);
        match task.status() {
            TaskStatus::Completed => self.completed.fetch_add(1, Ordering::SeqCst),
            _ => self.faulted.fetch_add(1, Ordering::SeqCst),
        };
        // Released before the driver can see the task finished, so it can be recycled
        drop(task);
        self.decrement_unfinished();
        self.notify();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use test_log::test;

    use super::*;
    use crate::configuration::SchedulerConfig;
    use crate::json_ext::Path;

    #[test(tokio::test)]
    async fn counts_and_collects_outcomes() {
        let scheduler =
            TrackableScheduler::new(&SchedulerConfig::builder().processors(2).build()).unwrap();
        let queue = Arc::new(ExecutionQueue::new());
        let operation = Arc::new(OperationContext::new(CancellationToken::new(), queue));

        let ok = ExecutionTask::parallel(Path::from("/a"), || async { Ok(()) });
        let failing = ExecutionTask::parallel(Path::from("/b/0"), || async {
            Err(FieldError::new("b is broken"))
        });
        operation.begin(ok.clone(), &scheduler);
        operation.begin(failing.clone(), &scheduler);
        // Starting twice is ignored
        operation.begin(ok.clone(), &scheduler);

        ok.wait_for_completion().await;
        failing.wait_for_completion().await;
        while operation.unfinished() > 0 {
            tokio::time::timeout(Duration::from_secs(5), operation.changed())
                .await
                .unwrap();
        }

        assert_eq!(operation.completed_count(), 1);
        assert_eq!(operation.faulted_count(), 1);
        assert_eq!(operation.running(), 0);
        assert_eq!(operation.take_started().len(), 2);

        let errors = operation.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "b is broken");
        assert_eq!(errors[0].path, Some(Path::from("/b/0")));
    }

    #[test]
    fn root_level_errors_have_no_path() {
        let queue = Arc::new(ExecutionQueue::new());
        let operation = OperationContext::new(CancellationToken::new(), queue);
        let task = ExecutionTask::parallel(Path::empty(), || async { Ok(()) });
        operation.report_error(&task, FieldError::new("operation failed"));
        assert_eq!(operation.take_errors()[0].path, None);
    }
}
