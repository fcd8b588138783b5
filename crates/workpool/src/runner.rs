//! Single-entry async runner: owns one event loop, runs one top-level future
//! to completion, and guarantees every background task spawned through
//! [`spawn`] is cancelled and finalized before returning.

use std::cell::RefCell;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::rc::Rc;

use tokio::runtime;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error};

use crate::error::RunnerError;

thread_local! {
    static CURRENT_RUNNER: RefCell<Option<Rc<TaskRegistry>>> = const { RefCell::new(None) };
}

/// Background tasks spawned while a runner is active on this thread.
struct TaskRegistry {
    tasks: RefCell<Vec<JoinHandle<()>>>,
}

/// Owns an event loop's full lifecycle.
///
/// Intended as the main entry point of an async program, called once:
///
/// ```no_run
/// let answer = workpool::Runner::new().run(async { 40 + 2 }).unwrap();
/// assert_eq!(answer, 42);
/// ```
pub struct Runner {
    debug: bool,
}

impl Runner {
    /// Creates a runner with default settings.
    pub fn new() -> Self {
        Self { debug: false }
    }

    /// Enables lifecycle debug events.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Runs `main` to completion on a fresh event loop and returns its value.
    ///
    /// Fails with [`RunnerError::AlreadyRunning`] before creating anything
    /// when an event loop is already active on this thread. On the way out,
    /// on success, error, and unwind alike, every residual task is cancelled
    /// and awaited, the loop is closed, and the thread-local runner slot is
    /// cleared.
    pub fn run<F: Future>(self, main: F) -> Result<F::Output, RunnerError> {
        if runtime::Handle::try_current().is_ok() {
            return Err(RunnerError::AlreadyRunning);
        }

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(RunnerError::Build)?;
        if self.debug {
            debug!("runner created a fresh event loop");
        }

        let registry = Rc::new(TaskRegistry {
            tasks: RefCell::new(Vec::new()),
        });
        let guard = RunnerGuard::install(registry.clone())?;

        let outcome = catch_unwind(AssertUnwindSafe(|| rt.block_on(main)));

        finalize(&rt, &registry, self.debug);
        drop(guard);
        drop(rt);
        if self.debug {
            debug!("runner closed the event loop");
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(payload) => resume_unwind(payload),
        }
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the thread-local runner slot even when the caller unwinds.
struct RunnerGuard;

impl RunnerGuard {
    fn install(registry: Rc<TaskRegistry>) -> Result<Self, RunnerError> {
        CURRENT_RUNNER.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(RunnerError::AlreadyRunning);
            }
            *slot = Some(registry);
            Ok(RunnerGuard)
        })
    }
}

impl Drop for RunnerGuard {
    fn drop(&mut self) {
        CURRENT_RUNNER.with(|slot| slot.borrow_mut().take());
    }
}

fn finalize(rt: &runtime::Runtime, registry: &TaskRegistry, debug_mode: bool) {
    // Cancelled tasks may spawn further tasks while unwinding; keep going
    // until the registry stays empty.
    loop {
        let tasks: Vec<JoinHandle<()>> = registry.tasks.borrow_mut().drain(..).collect();
        if tasks.is_empty() {
            break;
        }
        if debug_mode {
            debug!(count = tasks.len(), "runner cancelling residual tasks");
        }
        for task in &tasks {
            task.abort();
        }
        rt.block_on(async {
            for task in tasks {
                match task.await {
                    Ok(()) => {}
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => {
                        // The loop's exception handler: tasks that failed
                        // before cancellation reached them are reported, not
                        // re-raised.
                        error!("unhandled error during runner shutdown: {err}");
                    }
                }
            }
        });
    }
}

/// Runs `main` on a fresh event loop. Shorthand for
/// [`Runner::new().run(main)`](Runner::run).
pub fn run<F: Future>(main: F) -> Result<F::Output, RunnerError> {
    Runner::new().run(main)
}

/// Spawns a background task on the active runner's loop.
///
/// The task is tracked: if it is still alive when the runner's top-level
/// future finishes, it is cancelled and awaited before [`Runner::run`]
/// returns. Fails with [`RunnerError::NoRunner`] when no runner is active on
/// this thread.
pub fn spawn<F>(future: F) -> Result<TaskHandle<F::Output>, RunnerError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    CURRENT_RUNNER.with(|slot| {
        let slot = slot.borrow();
        let registry = slot.as_ref().ok_or(RunnerError::NoRunner)?;
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let value = future.await;
            let _ = done_tx.send(value);
        });
        let abort = task.abort_handle();
        registry.tasks.borrow_mut().push(task);
        Ok(TaskHandle {
            done: done_rx,
            abort,
        })
    })
}

/// Handle to a task spawned through [`spawn`].
pub struct TaskHandle<T> {
    done: oneshot::Receiver<T>,
    abort: AbortHandle,
}

impl<T> TaskHandle<T> {
    /// Requests cancellation of the task.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Waits for the task's value. Fails with [`RunnerError::TaskLost`] when
    /// the task was cancelled or panicked before completing.
    pub async fn join(self) -> Result<T, RunnerError> {
        self.done.await.map_err(|_| RunnerError::TaskLost)
    }
}
