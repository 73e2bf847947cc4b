//! Ordering of pending tasks in a parallel lane and a serial lane.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

use crate::task::ExecutionTask;

/// Pending tasks of one operation.
///
/// Tasks leave each lane in insertion order. Tasks of the parallel lane may all run at once,
/// while at most one task of the serial lane runs at any time: the next serial task is only
/// handed out after [`mark_completed`](ExecutionQueue::mark_completed) was called for the
/// running one.
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    lanes: Mutex<Lanes>,
}

#[derive(Debug, Default)]
struct Lanes {
    parallel: VecDeque<ExecutionTask>,
    serial: VecDeque<ExecutionTask>,
    running_serial: Option<ExecutionTask>,
}

impl Lanes {
    fn serial_ready(&self) -> bool {
        self.running_serial.is_none() && !self.serial.is_empty()
    }
}

/// A snapshot of the queue, for debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueDiagnostics {
    pub parallel: usize,
    pub serial: usize,
    pub serial_running: bool,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `task` to its lane. Rejected, returning false, if the task already is in a queue.
    pub fn enqueue(&self, task: &ExecutionTask) -> bool {
        if !task.register() {
            tracing::trace!(path = %task.path(), "task is already queued");
            return false;
        }
        let mut lanes = self.lanes.lock();
        if task.is_serial() {
            lanes.serial.push_back(task.clone());
        } else {
            lanes.parallel.push_back(task.clone());
        }
        true
    }

    /// Takes the next task that may start now.
    ///
    /// A serial task is preferred when no other serial task is running, so mutations are not
    /// starved by a large fan-out of parallel fields.
    pub fn try_dequeue_next(&self) -> Option<ExecutionTask> {
        let mut lanes = self.lanes.lock();
        let task = if lanes.serial_ready() {
            let task = lanes.serial.pop_front()?;
            lanes.running_serial = Some(task.clone());
            task
        } else {
            lanes.parallel.pop_front()?
        };
        task.unregister();
        Some(task)
    }

    /// Releases the serial lane if `task` is the running serial task.
    pub fn mark_completed(&self, task: &ExecutionTask) {
        let mut lanes = self.lanes.lock();
        if lanes
            .running_serial
            .as_ref()
            .is_some_and(|running| running.ptr_eq(task))
        {
            lanes.running_serial = None;
        }
    }

    /// True if [`try_dequeue_next`](ExecutionQueue::try_dequeue_next) would return a task.
    pub fn has_ready(&self) -> bool {
        let lanes = self.lanes.lock();
        !lanes.parallel.is_empty() || lanes.serial_ready()
    }

    /// True if both lanes are empty and no serial task is running.
    pub fn is_empty(&self) -> bool {
        let lanes = self.lanes.lock();
        lanes.parallel.is_empty() && lanes.serial.is_empty() && lanes.running_serial.is_none()
    }

    pub fn diagnostics(&self) -> QueueDiagnostics {
        let lanes = self.lanes.lock();
        QueueDiagnostics {
            parallel: lanes.parallel.len(),
            serial: lanes.serial.len(),
            serial_running: lanes.running_serial.is_some(),
        }
    }
}
