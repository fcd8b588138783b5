#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process parallel task-execution pool: a fixed set of workers, chunked
//! bulk maps, ordered and unordered result streaming, per-worker lifetime
//! limits, graceful or abrupt shutdown, plus a single-entry async [`runner`]
//! that owns its event loop's lifecycle.
//!
//! ```no_run
//! # async fn demo() -> Result<(), workpool::PoolError> {
//! let pool = workpool::Pool::builder().workers(4).build()?;
//! let squares = pool.map(|x: u64| x * x, 0..10, None).await?;
//! pool.close();
//! pool.join().await?;
//! # Ok(())
//! # }
//! ```

/// Public configuration surface for the pool.
pub mod api;
/// Single-entry async runner.
pub mod runner;

mod error;
mod pool;
mod results;
mod worker;

pub use api::{ArgTuple, PoolBuilder, PoolState};
pub use error::{PoolError, RunnerError, TaskError};
pub use pool::Pool;
pub use results::{ApplyHandle, AsyncHandle, Callbacks, MapHandle, ResultStream};
pub use runner::{Runner, TaskHandle, run, spawn};
