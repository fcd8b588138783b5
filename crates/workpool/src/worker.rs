use std::any::Any;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::TaskError;

/// Opaque payload produced by a task function.
pub(crate) type TaskPayload = Box<dyn Any + Send>;

/// What a task evaluates to once a worker has run it.
pub(crate) type TaskOutcome = Result<TaskPayload, TaskError>;

/// Type-erased task function carried through the input queue.
pub(crate) type TaskFn = Box<dyn FnOnce() -> TaskOutcome + Send>;

/// Per-worker startup hook, run once before the first task.
pub(crate) type Initializer = Arc<dyn Fn() + Send + Sync>;

/// A unit of work addressed by (job, index).
pub(crate) struct Task {
    pub(crate) job: u64,
    pub(crate) index: u64,
    pub(crate) func: TaskFn,
}

pub(crate) struct ResultEnvelope {
    pub(crate) job: u64,
    pub(crate) index: u64,
    pub(crate) outcome: TaskOutcome,
}

/// Input queue receiver, shared by every worker of a pool.
pub(crate) type InputReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Option<Task>>>>;

pub(crate) struct WorkerContext {
    pub(crate) input: InputReceiver,
    pub(crate) output: mpsc::UnboundedSender<Option<ResultEnvelope>>,
    pub(crate) initializer: Option<Initializer>,
    pub(crate) max_tasks: Option<usize>,
}

/// Worker loop: pull a task, run it, push the envelope. Exits on the queue
/// sentinel, on a closed queue, or once the task budget is spent.
pub(crate) async fn run_worker(ctx: WorkerContext) {
    if let Some(init) = ctx.initializer.clone() {
        if tokio::task::spawn_blocking(move || init()).await.is_err() {
            debug!("worker initializer failed, exiting");
            return;
        }
    }

    let mut completed = 0usize;
    loop {
        if let Some(max) = ctx.max_tasks {
            if completed >= max {
                debug!(completed, "worker reached its task budget, exiting");
                break;
            }
        }

        let message = { ctx.input.lock().await.recv().await };
        let task = match message {
            None => {
                debug!("worker input queue closed, exiting");
                break;
            }
            Some(None) => {
                debug!("worker got sentinel, exiting");
                break;
            }
            Some(Some(task)) => task,
        };

        let envelope = ResultEnvelope {
            job: task.job,
            index: task.index,
            outcome: invoke(task.func).await,
        };
        if ctx.output.send(Some(envelope)).is_err() {
            debug!("worker output queue closed, exiting");
            break;
        }
        completed += 1;
    }
    debug!(completed, "worker exiting");
}

/// Runs a task function on the blocking pool. A panic in the function is
/// converted into a task failure instead of tearing the worker down.
async fn invoke(func: TaskFn) -> TaskOutcome {
    match tokio::task::spawn_blocking(func).await {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => Err(TaskError::Panic {
            message: panic_message(err.into_panic()),
        }),
        Err(_) => Err(TaskError::Cancelled),
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic payload of unknown type".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::{Mutex, mpsc};

    use super::{ResultEnvelope, Task, TaskPayload, WorkerContext, run_worker};
    use crate::error::TaskError;

    type Wires = (
        mpsc::UnboundedSender<Option<Task>>,
        WorkerContext,
        mpsc::UnboundedReceiver<Option<ResultEnvelope>>,
    );

    fn wires(max_tasks: Option<usize>) -> Wires {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            input: Arc::new(Mutex::new(input_rx)),
            output: output_tx,
            initializer: None,
            max_tasks,
        };
        (input_tx, ctx, output_rx)
    }

    fn int_task(job: u64, index: u64, value: i32) -> Task {
        Task {
            job,
            index,
            func: Box::new(move || Ok(Box::new(value) as TaskPayload)),
        }
    }

    #[tokio::test]
    async fn runs_tasks_until_sentinel() {
        let (input_tx, ctx, mut output_rx) = wires(None);
        input_tx.send(Some(int_task(1, 0, 10))).unwrap();
        input_tx.send(Some(int_task(1, 1, 20))).unwrap();
        input_tx.send(None).unwrap();

        run_worker(ctx).await;

        for expected in [10, 20] {
            let envelope = output_rx.recv().await.unwrap().unwrap();
            let value = envelope.outcome.unwrap().downcast::<i32>().unwrap();
            assert_eq!(*value, expected);
        }
        assert!(output_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stops_at_task_budget() {
        let (input_tx, ctx, mut output_rx) = wires(Some(2));
        for i in 0..4 {
            input_tx.send(Some(int_task(1, i, i as i32))).unwrap();
        }

        run_worker(ctx).await;

        assert!(output_rx.recv().await.is_some());
        assert!(output_rx.recv().await.is_some());
        // The third task is still queued for a replacement worker.
        assert!(output_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn panic_becomes_task_error() {
        let (input_tx, ctx, mut output_rx) = wires(None);
        input_tx
            .send(Some(Task {
                job: 3,
                index: 0,
                func: Box::new(|| panic!("boom")),
            }))
            .unwrap();
        input_tx.send(None).unwrap();

        run_worker(ctx).await;

        let envelope = output_rx.recv().await.unwrap().unwrap();
        assert_eq!(
            envelope.outcome.unwrap_err(),
            TaskError::Panic {
                message: "boom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn initializer_panic_kills_worker_before_first_task() {
        let (input_tx, mut ctx, mut output_rx) = wires(None);
        ctx.initializer = Some(Arc::new(|| panic!("bad init")));
        input_tx.send(Some(int_task(1, 0, 1))).unwrap();

        run_worker(ctx).await;

        assert!(output_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn initializer_runs_once_before_tasks() {
        let (input_tx, mut ctx, mut output_rx) = wires(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        ctx.initializer = Some(Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        input_tx.send(Some(int_task(1, 0, 5))).unwrap();
        input_tx.send(None).unwrap();

        run_worker(ctx).await;

        assert!(output_rx.recv().await.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
