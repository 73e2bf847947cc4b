use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::task::Context;

use futures::future::BoxFuture;
use futures::task::ArcWake;
use futures::task::waker_ref;
use parking_lot::Mutex;

use super::Shared;

/// A future submitted to the scheduler. Waking it puts it back on the scheduler queue.
pub(super) struct ScheduledItem {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    /// Set while the item sits in the queue, so that repeated wakes only queue it once
    queued: AtomicBool,
    shared: Weak<Shared>,
}

impl ScheduledItem {
    pub(super) fn new(future: BoxFuture<'static, ()>, shared: Weak<Shared>) -> Arc<Self> {
        Arc::new(Self {
            future: Mutex::new(Some(future)),
            queued: AtomicBool::new(false),
            shared,
        })
    }

    /// Returns false if the item already was in the queue.
    pub(super) fn mark_queued(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }

    pub(super) fn unmark_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    /// Polls the future once.
    pub(super) fn run(self: &Arc<Self>, shutting_down: impl Fn() -> bool) {
        self.unmark_queued();
        let mut slot = self.future.lock();
        if let Some(mut future) = slot.take() {
            let waker = waker_ref(self);
            let mut cx = Context::from_waker(&waker);
            if future.as_mut().poll(&mut cx).is_pending() && !shutting_down() {
                *slot = Some(future);
            }
        }
    }

    /// Drops the future without running it any further. Its completion handle resolves with
    /// `SchedulerError::ShutDown`.
    pub(super) fn abandon(&self) {
        // The item may be abandoned from within its own poll, in which case `run` drops it.
        if let Some(mut slot) = self.future.try_lock() {
            slot.take();
        }
    }
}

impl ArcWake for ScheduledItem {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        match arc_self.shared.upgrade() {
            Some(shared) => {
                shared.enqueue(arc_self.clone());
            }
            None => arc_self.abandon(),
        }
    }
}
