//! A task scheduler that allows tracking if work is still in progress.
//!
//! Work items are futures. A fixed pool of processor loops pulls them from a shared queue and
//! polls them; an item that suspends is queued again by its waker. The scheduler counts items
//! that are queued or being polled, and waiters registered with
//! [`TrackableScheduler::wait_till_idle`] are released whenever that count drops to zero.

mod item;
mod underlying;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::RecvTimeoutError;
use futures::FutureExt;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use self::item::ScheduledItem;
pub use self::underlying::ThreadExecutor;
pub use self::underlying::TokioBlockingExecutor;
pub use self::underlying::UnderlyingExecutor;
use crate::configuration::SchedulerConfig;
use crate::configuration::UnderlyingKind;
use crate::error::SchedulerError;
use crate::error::panic_message;

/// Tracks work submitted to a fixed pool of processors and signals when it has drained.
///
/// One scheduler is created per operation execution and discarded afterward.
pub struct TrackableScheduler {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    /// Taken on completion, so no more work is accepted
    sender: RwLock<Option<crossbeam_channel::Sender<Arc<ScheduledItem>>>>,
    receiver: crossbeam_channel::Receiver<Arc<ScheduledItem>>,
    /// Number of items that are queued or being polled
    in_flight: AtomicUsize,
    /// Registration and release both happen under this lock.
    idle_waiters: Mutex<IdleWaiters>,
    shutdown: AtomicBool,
    poll_timeout: Duration,
    processors: usize,
    running_processors: AtomicUsize,
    runtime: Option<Handle>,
}

#[derive(Default)]
struct IdleWaiters {
    /// Released when `in_flight` is zero
    idle: Vec<oneshot::Sender<()>>,
    /// Released the next time `in_flight` drops to zero
    transition: Vec<oneshot::Sender<()>>,
    /// How often `in_flight` dropped to zero so far
    transitions: u64,
}

/// A snapshot of the scheduler state, for debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerDiagnostics {
    /// Items waiting in the queue.
    pub queued: usize,
    /// Items queued or being polled.
    pub in_flight: usize,
    /// Size of the processor pool.
    pub processors: usize,
    /// Processor loops that have not exited yet.
    pub running_processors: usize,
    /// Whether [`TrackableScheduler::complete`] was called.
    pub shut_down: bool,
}

impl TrackableScheduler {
    /// Creates a scheduler whose processors run on the executor selected by `config`.
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        match config.executor() {
            UnderlyingKind::Threads => Self::with_executor(config, &ThreadExecutor),
            UnderlyingKind::TokioBlocking => {
                let executor = TokioBlockingExecutor::current().ok_or(SchedulerError::NoRuntime)?;
                Self::with_executor(config, &executor)
            }
        }
    }

    /// Creates a scheduler whose processors run on `executor`.
    pub fn with_executor(
        config: &SchedulerConfig,
        executor: &dyn UnderlyingExecutor,
    ) -> Result<Self, SchedulerError> {
        let processors = config.processors().max(1);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            sender: RwLock::new(Some(sender)),
            receiver,
            in_flight: AtomicUsize::new(0),
            idle_waiters: Mutex::new(IdleWaiters::default()),
            shutdown: AtomicBool::new(false),
            poll_timeout: config.poll_timeout(),
            processors,
            running_processors: AtomicUsize::new(0),
            runtime: Handle::try_current().ok(),
        });
        let scheduler = TrackableScheduler { shared };

        tracing::info!(
            configured_size = processors,
            "starting scheduler processors with size"
        );
        for index in 0..processors {
            let shared = scheduler.shared.clone();
            shared.running_processors.fetch_add(1, Ordering::SeqCst);
            let spawned = executor.spawn(
                format!("execution-processor-{index}"),
                Box::new(move || shared.process(index)),
            );
            if let Err(error) = spawned {
                scheduler.shared.running_processors.fetch_sub(1, Ordering::SeqCst);
                // Dropping the scheduler stops the processors already started
                return Err(SchedulerError::SpawnFailed {
                    reason: error.to_string(),
                });
            }
        }

        Ok(scheduler)
    }

    /// Submits `future` for execution and returns a handle resolving to its output.
    ///
    /// A panic inside `future` is caught and surfaces as [`SchedulerError::Panicked`]. If the
    /// scheduler was completed, the handle resolves to [`SchedulerError::ShutDown`].
    pub fn schedule<F, T>(&self, future: F) -> CompletionHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let work = async move {
            let result = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .map_err(|payload| SchedulerError::Panicked {
                    message: panic_message(payload.as_ref()),
                });
            // Ignore the error if the handle was dropped
            let _ = tx.send(result);
        };
        let item = ScheduledItem::new(Box::pin(work), Arc::downgrade(&self.shared));
        self.shared.enqueue(item);
        CompletionHandle { receiver: rx }
    }

    /// True if no work is queued or running.
    pub fn is_idle(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Resolves once no work is queued or running.
    ///
    /// Resolves immediately if the scheduler is idle already. Returns
    /// [`SchedulerError::Cancelled`] if `cancellation` fires first.
    pub async fn wait_till_idle(
        &self,
        cancellation: Option<&CancellationToken>,
    ) -> Result<(), SchedulerError> {
        let receiver = {
            let mut waiters = self.shared.idle_waiters.lock();
            if cancellation.is_some_and(CancellationToken::is_cancelled) {
                return Err(SchedulerError::Cancelled);
            }
            if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            waiters.idle.retain(|waiter| !waiter.is_closed());
            let (tx, rx) = oneshot::channel();
            waiters.idle.push(tx);
            rx
        };

        match cancellation {
            Some(token) => tokio::select! {
                biased;
                _ = receiver => Ok(()),
                _ = token.cancelled() => Err(SchedulerError::Cancelled),
            },
            None => {
                // The sender is only dropped on release
                let _ = receiver.await;
                Ok(())
            }
        }
    }

    /// How often the scheduler went from busy to idle so far.
    pub fn idle_transitions(&self) -> u64 {
        self.shared.idle_waiters.lock().transitions
    }

    /// Resolves once the scheduler went idle again after `seen` idle transitions, as returned
    /// by [`idle_transitions`](TrackableScheduler::idle_transitions).
    ///
    /// Unlike [`wait_till_idle`](TrackableScheduler::wait_till_idle) this does not resolve
    /// while the scheduler merely stays idle, so it observes work that gets woken up and
    /// suspends again. It also resolves once the scheduler is completed.
    pub async fn wait_idle_transition(&self, seen: u64) {
        let receiver = {
            let mut waiters = self.shared.idle_waiters.lock();
            if waiters.transitions > seen || self.shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            waiters.transition.retain(|waiter| !waiter.is_closed());
            let (tx, rx) = oneshot::channel();
            waiters.transition.push(tx);
            rx
        };
        // Dropped senders on completion resolve the wait as well
        let _ = receiver.await;
    }

    /// Stops accepting new work and lets the processors exit after the items they are polling.
    ///
    /// Work still in the queue is dropped. Calling this more than once has no effect.
    pub fn complete(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.shared.sender.write().take());

        let mut abandoned = 0usize;
        while let Ok(item) = self.shared.receiver.try_recv() {
            item.abandon();
            self.shared.finish_item();
            abandoned += 1;
        }
        drop(std::mem::take(&mut self.shared.idle_waiters.lock().transition));
        tracing::debug!(abandoned, "scheduler completed");
    }

    /// A snapshot of the queue and processors.
    pub fn diagnostics(&self) -> SchedulerDiagnostics {
        SchedulerDiagnostics {
            queued: self.shared.receiver.len(),
            in_flight: self.shared.in_flight.load(Ordering::SeqCst),
            processors: self.shared.processors,
            running_processors: self.shared.running_processors.load(Ordering::SeqCst),
            shut_down: self.shared.shutdown.load(Ordering::SeqCst),
        }
    }
}

impl Drop for TrackableScheduler {
    fn drop(&mut self) {
        self.complete();
    }
}

impl std::fmt::Debug for TrackableScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackableScheduler")
            .field("diagnostics", &self.diagnostics())
            .finish()
    }
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Puts `item` on the queue unless it is there already. Returns false if the scheduler no
    /// longer accepts work, in which case the item is abandoned.
    fn enqueue(&self, item: Arc<ScheduledItem>) -> bool {
        if !item.mark_queued() {
            return true;
        }
        // Abandoning happens after the lock is released, dropping a future can wake other items
        let (item, counted) = match self.sender.read().as_ref() {
            Some(sender) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                match sender.send(item) {
                    Ok(()) => return true,
                    Err(crossbeam_channel::SendError(item)) => (item, true),
                }
            }
            None => {
                failfast_debug!("work was scheduled after the scheduler completed");
                (item, false)
            }
        };
        item.unmark_queued();
        item.abandon();
        if counted {
            self.finish_item();
        }
        false
    }

    fn process(self: Arc<Self>, index: usize) {
        let _runtime = self.runtime.as_ref().map(Handle::enter);
        tracing::debug!(processor = index, "scheduler processor started");

        while !self.is_shutting_down() {
            match self.receiver.recv_timeout(self.poll_timeout) {
                Ok(item) => {
                    let started = Instant::now();
                    self.execute(item);
                    // Drain what is immediately available without blocking again
                    while started.elapsed() < self.poll_timeout && !self.is_shutting_down() {
                        match self.receiver.try_recv() {
                            Ok(item) => self.execute(item),
                            Err(_) => break,
                        }
                    }
                    if !self.is_shutting_down() {
                        // give other work a chance to run fairly as well
                        std::thread::yield_now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.running_processors.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(processor = index, "scheduler processor stopped");
    }

    fn execute(&self, item: Arc<ScheduledItem>) {
        let polled = std::panic::catch_unwind(AssertUnwindSafe(|| {
            item.run(|| self.is_shutting_down())
        }));
        if let Err(payload) = polled {
            failfast_error!(
                "unexpected panic while polling a work item: {}",
                panic_message(payload.as_ref())
            );
        }
        self.finish_item();
    }

    fn finish_item(&self) {
        let previous =
            self.in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                    count.checked_sub(1)
                });
        match previous {
            Ok(1) => self.release_idle_waiters(),
            Ok(_) => {}
            Err(_) => {
                failfast_error!(
                    "inconsistent in-flight count, investigate why this is happening"
                );
                self.release_idle_waiters();
            }
        }
    }

    fn release_idle_waiters(&self) {
        let mut waiters = self.idle_waiters.lock();
        // More work may have been queued since the count reached zero
        if self.in_flight.load(Ordering::SeqCst) == 0 {
            waiters.transitions += 1;
            let IdleWaiters { idle, transition, .. } = &mut *waiters;
            for waiter in idle.drain(..).chain(transition.drain(..)) {
                let _ = waiter.send(());
            }
        }
    }
}

/// Resolves to the output of a scheduled future.
#[must_use = "completion handles do nothing unless polled"]
pub struct CompletionHandle<T> {
    receiver: oneshot::Receiver<Result<T, SchedulerError>>,
}

impl<T> Future for CompletionHandle<T> {
    type Output = Result<T, SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SchedulerError::ShutDown)))
    }
}

static_assertions::assert_impl_all!(TrackableScheduler: Send, Sync);
