//! Public configuration surface for the pool.

use std::sync::Arc;

use crate::error::PoolError;
use crate::pool::Pool;
use crate::worker::Initializer;

/// Control state of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting submissions.
    Run,
    /// No new submissions; queued work still completes.
    Close,
    /// Forced shutdown; outstanding work may be abandoned.
    Terminate,
}

/// Builder for [`Pool`].
///
/// ```no_run
/// # async fn demo() -> Result<(), workpool::PoolError> {
/// let pool = workpool::Pool::builder().workers(4).build()?;
/// let doubled = pool.map(|x: u64| x * 2, 0..8, None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct PoolBuilder {
    workers: Option<usize>,
    initializer: Option<Initializer>,
    max_tasks_per_worker: Option<usize>,
}

impl PoolBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workers to run concurrently.
    ///
    /// Defaults to the logical CPU count (at least 1). Zero is rejected at
    /// [`build`](Self::build).
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = Some(count);
        self
    }

    /// Startup hook run once in every worker before its first task.
    ///
    /// A panic in the hook kills the worker immediately; the supervisor will
    /// notice the exit and spawn a replacement.
    pub fn initializer(mut self, init: impl Fn() + Send + Sync + 'static) -> Self {
        self.initializer = Some(Arc::new(init));
        self
    }

    /// Maximum number of tasks a worker may run before it exits and is
    /// replaced by a fresh one. Unlimited when not set.
    pub fn max_tasks_per_worker(mut self, budget: usize) -> Self {
        self.max_tasks_per_worker = Some(budget);
        self
    }

    /// Builds the pool: spawns the workers and the three coordinators.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn build(self) -> Result<Pool, PoolError> {
        let workers = match self.workers {
            None => num_cpus::get().max(1),
            Some(0) => return Err(PoolError::InvalidWorkerCount),
            Some(count) => count,
        };
        if self.max_tasks_per_worker == Some(0) {
            return Err(PoolError::InvalidTaskBudget);
        }
        Ok(Pool::start(PoolConfig {
            workers,
            initializer: self.initializer,
            max_tasks: self.max_tasks_per_worker,
        }))
    }
}

pub(crate) struct PoolConfig {
    pub(crate) workers: usize,
    pub(crate) initializer: Option<Initializer>,
    pub(crate) max_tasks: Option<usize>,
}

/// Argument bundles accepted by the `starmap` family: a tuple item
/// `(a, b)` is applied to `f` as `f(a, b)`.
pub trait ArgTuple<F, R>: Send {
    /// Applies the bundled arguments to `f`.
    fn call(self, f: &F) -> R;
}

macro_rules! impl_arg_tuple {
    ($($arg:ident : $idx:tt),+) => {
        impl<F, R, $($arg),+> ArgTuple<F, R> for ($($arg,)+)
        where
            F: Fn($($arg),+) -> R,
            $($arg: Send,)+
        {
            fn call(self, f: &F) -> R {
                f($(self.$idx),+)
            }
        }
    };
}

impl_arg_tuple!(A1: 0);
impl_arg_tuple!(A1: 0, A2: 1);
impl_arg_tuple!(A1: 0, A2: 1, A3: 2);
impl_arg_tuple!(A1: 0, A2: 1, A3: 2, A4: 3);
impl_arg_tuple!(A1: 0, A2: 1, A3: 2, A4: 3, A5: 4);
impl_arg_tuple!(A1: 0, A2: 1, A3: 2, A4: 3, A5: 4, A6: 5);
