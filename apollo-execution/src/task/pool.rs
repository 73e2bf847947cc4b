use std::future::Future;

use parking_lot::Mutex;

use super::ExecutionTask;
use super::TaskKind;
use crate::error::FieldError;
use crate::json_ext::Path;

/// Keeps finished tasks around so later operations reuse their allocations.
#[derive(Debug)]
pub struct TaskPool {
    idle: Mutex<Vec<ExecutionTask>>,
    capacity: usize,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    /// Returns a task ready to run `work`, reusing an idle one when possible.
    pub fn rent<F, Fut>(&self, kind: TaskKind, path: Path, work: F) -> ExecutionTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FieldError>> + Send + 'static,
    {
        let recycled = self.idle.lock().pop();
        match recycled {
            Some(task) => {
                task.prepare(kind, path, work);
                task
            }
            None => ExecutionTask::new(kind, path, work),
        }
    }

    /// Hands `task` back to the pool. The task is only kept if nothing else refers to it and
    /// the pool is not full; returns whether it was kept.
    pub fn recycle(&self, task: ExecutionTask) -> bool {
        if task.strong_count() != 1 || !task.status().is_terminal() {
            return false;
        }
        let mut idle = self.idle.lock();
        if idle.len() >= self.capacity {
            return false;
        }
        task.reset();
        idle.push(task);
        true
    }

    /// Number of idle tasks.
    pub fn len(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
