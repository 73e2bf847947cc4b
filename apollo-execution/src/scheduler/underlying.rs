use std::io;

use tokio::runtime::Handle;

/// The executor that hosts the long running processor loops of a
/// [`TrackableScheduler`](super::TrackableScheduler).
pub trait UnderlyingExecutor: Send + Sync {
    /// Starts `processor` on its own thread of execution. The processor only returns once the
    /// scheduler has been completed.
    fn spawn(&self, name: String, processor: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()>;
}

/// Runs each processor on a dedicated OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadExecutor;

impl UnderlyingExecutor for ThreadExecutor {
    fn spawn(&self, name: String, processor: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        std::thread::Builder::new()
            .name(name)
            .spawn(processor)
            .map(|_detached| ())
    }
}

/// Runs each processor on the blocking pool of a Tokio runtime, so threads are
/// reused across schedulers.
#[derive(Debug, Clone)]
pub struct TokioBlockingExecutor {
    handle: Handle,
}

impl TokioBlockingExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running in, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl UnderlyingExecutor for TokioBlockingExecutor {
    fn spawn(&self, _name: String, processor: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        // Ignore the join handle, processors report through the scheduler
        let _ = self.handle.spawn_blocking(processor);
        Ok(())
    }
}
