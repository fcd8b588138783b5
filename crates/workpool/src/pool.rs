use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::api::{ArgTuple, PoolConfig, PoolState};
use crate::error::{PoolError, TaskError};
use crate::results::{
    ApplyHandle, Callbacks, JobCache, MapHandle, ResultSink, ResultStream, lock,
};
use crate::worker::{
    Initializer, InputReceiver, ResultEnvelope, Task, TaskFn, WorkerContext, panic_message,
    run_worker,
};

/// Cadence of the worker supervisor's reap-and-respawn scan.
const SUPERVISOR_TICK: Duration = Duration::from_millis(100);

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: PoolState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> PoolState {
        match self.0.load(Ordering::Acquire) {
            0 => PoolState::Run,
            1 => PoolState::Close,
            _ => PoolState::Terminate,
        }
    }

    fn set(&self, state: PoolState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// One entry on the submission queue: a lazy task sequence plus the sink
/// that learns the final item count once the sequence is exhausted.
struct SubmitBatch {
    tasks: Box<dyn Iterator<Item = Task> + Send>,
    length_sink: Option<Arc<dyn ResultSink>>,
}

struct WorkerSlot {
    join: JoinHandle<()>,
}

struct PoolShared {
    target_workers: usize,
    max_tasks: Option<usize>,
    initializer: Option<Initializer>,
    state: StateCell,
    supervisor_state: StateCell,
    dispatcher_state: StateCell,
    result_state: StateCell,
    cache: Arc<JobCache>,
    submission_tx: mpsc::UnboundedSender<Option<SubmitBatch>>,
    input_tx: mpsc::UnboundedSender<Option<Task>>,
    input_rx: InputReceiver,
    output_tx: mpsc::UnboundedSender<Option<ResultEnvelope>>,
    workers: StdMutex<Vec<WorkerSlot>>,
    spawned_total: AtomicUsize,
}

/// Parallel task-execution pool.
///
/// Dispatches caller-supplied functions to a fixed set of workers, collects
/// results into caller-visible handles, and supports ordered and unordered
/// streaming, chunked bulk maps, per-worker lifetime limits, and graceful
/// (`close` + `join`) or abrupt (`terminate`) shutdown.
///
/// Dropping a pool that was not joined performs a best-effort terminate.
pub struct Pool {
    shared: Arc<PoolShared>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
    results: StdMutex<Option<JoinHandle<()>>>,
    finalized: AtomicBool,
}

impl Pool {
    /// Builder entry point; see [`PoolBuilder`](crate::PoolBuilder).
    pub fn builder() -> crate::api::PoolBuilder {
        crate::api::PoolBuilder::new()
    }

    pub(crate) fn start(config: PoolConfig) -> Pool {
        let (submission_tx, submission_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(PoolShared {
            target_workers: config.workers,
            max_tasks: config.max_tasks,
            initializer: config.initializer,
            state: StateCell::new(PoolState::Run),
            supervisor_state: StateCell::new(PoolState::Run),
            dispatcher_state: StateCell::new(PoolState::Run),
            result_state: StateCell::new(PoolState::Run),
            cache: Arc::new(JobCache::new()),
            submission_tx,
            input_tx,
            input_rx: Arc::new(tokio::sync::Mutex::new(input_rx)),
            output_tx,
            workers: StdMutex::new(Vec::new()),
            spawned_total: AtomicUsize::new(0),
        });

        repopulate(&shared);

        let supervisor = tokio::spawn(run_supervisor(shared.clone()));
        let dispatcher = tokio::spawn(run_dispatcher(shared.clone(), submission_rx));
        let results = tokio::spawn(run_results(shared.clone(), output_rx));

        Pool {
            shared,
            supervisor: StdMutex::new(Some(supervisor)),
            dispatcher: StdMutex::new(Some(dispatcher)),
            results: StdMutex::new(Some(results)),
            finalized: AtomicBool::new(false),
        }
    }

    /// Current pool state.
    pub fn state(&self) -> PoolState {
        self.shared.state.get()
    }

    /// Number of workers the pool keeps alive.
    pub fn worker_count(&self) -> usize {
        self.shared.target_workers
    }

    /// Total workers spawned over the pool's lifetime; exceeds
    /// [`worker_count`](Self::worker_count) once replacements happen.
    pub fn workers_spawned(&self) -> usize {
        self.shared.spawned_total.load(Ordering::Relaxed)
    }

    fn check_running(&self) -> Result<(), PoolError> {
        if self.shared.state.get() != PoolState::Run {
            return Err(PoolError::NotRunning);
        }
        Ok(())
    }

    fn submit(&self, batch: SubmitBatch) {
        if self.shared.submission_tx.send(Some(batch)).is_err() {
            debug!("submission queue closed, dropping batch");
        }
    }

    /// Runs `f` on a worker and waits for its value.
    pub async fn apply<F, R>(&self, f: F) -> Result<R, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.apply_async(f)?.get().await
    }

    /// Submits `f` and returns a handle to its eventual value.
    pub fn apply_async<F, R>(&self, f: F) -> Result<ApplyHandle<R>, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.apply_async_with(f, Callbacks::new())
    }

    /// [`apply_async`](Self::apply_async) with completion callbacks.
    pub fn apply_async_with<F, R>(
        &self,
        f: F,
        callbacks: Callbacks<R>,
    ) -> Result<ApplyHandle<R>, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.check_running()?;
        let handle = ApplyHandle::new(&self.shared.cache, callbacks);
        let func: TaskFn = Box::new(move || Ok(Box::new(f()) as Box<dyn Any + Send>));
        let tasks = GuardedTasks::new(handle.job(), std::iter::once(func));
        self.submit(SubmitBatch {
            tasks: Box::new(tasks),
            length_sink: None,
        });
        Ok(handle)
    }

    /// Applies `f` to every item, returning outputs in input order.
    ///
    /// Items are submitted in chunks; when `chunksize` is `None` it defaults
    /// to roughly a quarter of the per-worker share of the input.
    pub async fn map<F, T, R>(
        &self,
        f: F,
        items: impl IntoIterator<Item = T>,
        chunksize: Option<usize>,
    ) -> Result<Vec<R>, PoolError>
    where
        F: Fn(T) -> R + Send + Sync + 'static,
        T: Send + 'static,
        R: Send + 'static,
    {
        self.map_async(f, items, chunksize)?.get().await
    }

    /// Asynchronous version of [`map`](Self::map).
    pub fn map_async<F, T, R>(
        &self,
        f: F,
        items: impl IntoIterator<Item = T>,
        chunksize: Option<usize>,
    ) -> Result<MapHandle<R>, PoolError>
    where
        F: Fn(T) -> R + Send + Sync + 'static,
        T: Send + 'static,
        R: Send + 'static,
    {
        self.map_async_with(f, items, chunksize, Callbacks::new())
    }

    /// [`map_async`](Self::map_async) with completion callbacks.
    pub fn map_async_with<F, T, R>(
        &self,
        f: F,
        items: impl IntoIterator<Item = T>,
        chunksize: Option<usize>,
        callbacks: Callbacks<Vec<R>>,
    ) -> Result<MapHandle<R>, PoolError>
    where
        F: Fn(T) -> R + Send + Sync + 'static,
        T: Send + 'static,
        R: Send + 'static,
    {
        let f = Arc::new(f);
        self.map_batch(f, items.into_iter().collect(), chunksize, callbacks)
    }

    /// Like [`map`](Self::map), but each item is a tuple of arguments
    /// unpacked into `f`: `(a, b)` becomes `f(a, b)`.
    pub async fn starmap<F, A, R>(
        &self,
        f: F,
        items: impl IntoIterator<Item = A>,
        chunksize: Option<usize>,
    ) -> Result<Vec<R>, PoolError>
    where
        F: Send + Sync + 'static,
        A: ArgTuple<F, R> + 'static,
        R: Send + 'static,
    {
        self.starmap_async(f, items, chunksize)?.get().await
    }

    /// Asynchronous version of [`starmap`](Self::starmap).
    pub fn starmap_async<F, A, R>(
        &self,
        f: F,
        items: impl IntoIterator<Item = A>,
        chunksize: Option<usize>,
    ) -> Result<MapHandle<R>, PoolError>
    where
        F: Send + Sync + 'static,
        A: ArgTuple<F, R> + 'static,
        R: Send + 'static,
    {
        self.starmap_async_with(f, items, chunksize, Callbacks::new())
    }

    /// [`starmap_async`](Self::starmap_async) with completion callbacks.
    pub fn starmap_async_with<F, A, R>(
        &self,
        f: F,
        items: impl IntoIterator<Item = A>,
        chunksize: Option<usize>,
        callbacks: Callbacks<Vec<R>>,
    ) -> Result<MapHandle<R>, PoolError>
    where
        F: Send + Sync + 'static,
        A: ArgTuple<F, R> + 'static,
        R: Send + 'static,
    {
        let f = Arc::new(f);
        let apply = Arc::new(move |args: A| args.call(&f));
        self.map_batch(apply, items.into_iter().collect(), chunksize, callbacks)
    }

    fn map_batch<T, R>(
        &self,
        apply: Arc<dyn Fn(T) -> R + Send + Sync>,
        items: Vec<T>,
        chunksize: Option<usize>,
        callbacks: Callbacks<Vec<R>>,
    ) -> Result<MapHandle<R>, PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        self.check_running()?;
        let length = items.len();
        let chunksize = match chunksize {
            Some(0) => return Err(PoolError::InvalidChunkSize),
            Some(size) if length > 0 => size,
            Some(_) => 0,
            None => default_chunksize(length, self.shared.target_workers),
        };
        let handle = MapHandle::new(&self.shared.cache, chunksize, length, callbacks);
        let funcs = chunk_funcs(apply, items, chunksize.max(1));
        let tasks = GuardedTasks::new(handle.job(), funcs.into_iter());
        self.submit(SubmitBatch {
            tasks: Box::new(tasks),
            length_sink: None,
        });
        Ok(handle)
    }

    /// Streaming equivalent of [`map`](Self::map): results arrive lazily, in
    /// input order. Larger `chunksize` trades latency for less queue traffic.
    pub fn imap<F, T, R, I>(
        &self,
        f: F,
        items: I,
        chunksize: usize,
    ) -> Result<ResultStream<R>, PoolError>
    where
        F: Fn(T) -> R + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Send + 'static,
        R: Send + 'static,
    {
        self.stream(f, items, chunksize, true)
    }

    /// Like [`imap`](Self::imap), but results arrive in completion order.
    pub fn imap_unordered<F, T, R, I>(
        &self,
        f: F,
        items: I,
        chunksize: usize,
    ) -> Result<ResultStream<R>, PoolError>
    where
        F: Fn(T) -> R + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Send + 'static,
        R: Send + 'static,
    {
        self.stream(f, items, chunksize, false)
    }

    fn stream<F, T, R, I>(
        &self,
        f: F,
        items: I,
        chunksize: usize,
        ordered: bool,
    ) -> Result<ResultStream<R>, PoolError>
    where
        F: Fn(T) -> R + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Send + 'static,
        R: Send + 'static,
    {
        self.check_running()?;
        if chunksize == 0 {
            return Err(PoolError::InvalidChunkSize);
        }
        let f = Arc::new(f);
        let stream = ResultStream::new(&self.shared.cache, ordered, chunksize > 1);
        let job = stream.job();
        let length_sink = Some(stream.sink());

        let tasks: Box<dyn Iterator<Item = Task> + Send> = if chunksize == 1 {
            let funcs = items.into_iter().map(move |item| {
                let f = f.clone();
                Box::new(move || Ok(Box::new(f(item)) as Box<dyn Any + Send>)) as TaskFn
            });
            Box::new(GuardedTasks::new(job, funcs))
        } else {
            let chunks = ChunkedSource {
                inner: items.into_iter(),
                size: chunksize,
            };
            let funcs = chunks.map(move |chunk| {
                let f = f.clone();
                Box::new(move || {
                    let out: Vec<R> = chunk.into_iter().map(|item| f(item)).collect();
                    Ok(Box::new(out) as Box<dyn Any + Send>)
                }) as TaskFn
            });
            Box::new(GuardedTasks::new(job, funcs))
        };

        self.submit(SubmitBatch { tasks, length_sink });
        Ok(stream)
    }

    /// Stops accepting submissions. Already-queued work still completes;
    /// idempotent once closed.
    pub fn close(&self) {
        if self.shared.state.get() == PoolState::Run {
            debug!("closing pool");
            self.shared.state.set(PoolState::Close);
            self.shared.supervisor_state.set(PoolState::Close);
        }
    }

    /// Forced shutdown: stops the coordinators, aborts workers that have not
    /// exited, and reaps everything. Outstanding jobs may be abandoned and
    /// their handles never become ready. Idempotent.
    pub async fn terminate(&self) {
        debug!("terminating pool");
        self.shared.state.set(PoolState::Terminate);
        self.shared.supervisor_state.set(PoolState::Terminate);
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.terminate_pool().await;
    }

    /// Waits for the coordinators and every worker to exit. The pool must be
    /// closed or terminated first.
    pub async fn join(&self) -> Result<(), PoolError> {
        if self.shared.state.get() == PoolState::Run {
            return Err(PoolError::StillRunning);
        }
        debug!("joining pool");
        for slot in [&self.supervisor, &self.dispatcher, &self.results] {
            let handle = lock(slot).take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
        loop {
            let worker = lock(&self.shared.workers).pop();
            match worker {
                Some(worker) => {
                    let _ = worker.join.await;
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn terminate_pool(&self) {
        debug!("finalizing pool");
        self.shared.dispatcher_state.set(PoolState::Terminate);

        self.help_stuff_finish();

        let results_dead = {
            let guard = lock(&self.results);
            guard.as_ref().is_none_or(|handle| handle.is_finished())
        };
        if results_dead && !self.shared.cache.is_empty() {
            error!(
                outstanding = self.shared.cache.len(),
                "result demultiplexer exited with jobs still outstanding"
            );
            debug_assert!(
                false,
                "cache must be empty once the result demultiplexer is gone"
            );
        }

        self.shared.result_state.set(PoolState::Terminate);
        let _ = self.shared.output_tx.send(None);

        // The supervisor must be gone before workers are stopped, so it
        // cannot respawn them behind our back.
        debug!("joining worker supervisor");
        let supervisor = lock(&self.supervisor).take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        {
            let workers = lock(&self.shared.workers);
            for slot in workers.iter() {
                if !slot.join.is_finished() {
                    slot.join.abort();
                }
            }
        }

        debug!("joining task dispatcher");
        let dispatcher = lock(&self.dispatcher).take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }

        debug!("joining result demultiplexer");
        let results = lock(&self.results).take();
        if let Some(handle) = results {
            let _ = handle.await;
        }

        loop {
            let worker = lock(&self.shared.workers).pop();
            match worker {
                Some(worker) => {
                    let _ = worker.join.await;
                }
                None => break,
            }
        }
        debug!("pool finalized");
    }

    /// Drains queued tasks so workers reach their sentinels quickly, then
    /// queues one sentinel per worker.
    ///
    /// An idle worker parks on `recv` while holding the receiver lock, and in
    /// that case the queue is already empty; `try_lock` skips the drain
    /// instead of deadlocking against it.
    fn help_stuff_finish(&self) {
        debug!("draining input queue");
        if let Ok(mut input) = self.shared.input_rx.try_lock() {
            while input.try_recv().is_ok() {}
        }
        let workers = lock(&self.shared.workers).len();
        for _ in 0..workers {
            let _ = self.shared.input_tx.send(None);
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        // Scoped-use exit without an executor at hand: flip every state,
        // wake the coordinators with sentinels, abort what remains.
        self.shared.state.set(PoolState::Terminate);
        self.shared.supervisor_state.set(PoolState::Terminate);
        self.shared.dispatcher_state.set(PoolState::Terminate);
        self.shared.result_state.set(PoolState::Terminate);
        let _ = self.shared.submission_tx.send(None);
        let _ = self.shared.output_tx.send(None);
        let worker_count = lock(&self.shared.workers).len();
        for _ in 0..worker_count {
            let _ = self.shared.input_tx.send(None);
        }
        for slot in [&self.supervisor, &self.dispatcher, &self.results] {
            if let Some(handle) = lock(slot).take() {
                handle.abort();
            }
        }
        for worker in lock(&self.shared.workers).drain(..) {
            worker.join.abort();
        }
    }
}

/// `ceil(len / (4 * workers))`, clamped to 1 for non-empty input.
fn default_chunksize(length: usize, workers: usize) -> usize {
    if length == 0 {
        return 0;
    }
    let buckets = workers * 4;
    let chunksize = length / buckets + usize::from(length % buckets != 0);
    chunksize.max(1)
}

fn chunk_funcs<T, R>(
    apply: Arc<dyn Fn(T) -> R + Send + Sync>,
    items: Vec<T>,
    chunksize: usize,
) -> Vec<TaskFn>
where
    T: Send + 'static,
    R: Send + 'static,
{
    let mut funcs = Vec::new();
    let mut items = items.into_iter();
    loop {
        let chunk: Vec<T> = items.by_ref().take(chunksize).collect();
        if chunk.is_empty() {
            break;
        }
        let apply = apply.clone();
        funcs.push(Box::new(move || {
            let out: Vec<R> = chunk.into_iter().map(|item| apply(item)).collect();
            Ok(Box::new(out) as Box<dyn Any + Send>)
        }) as TaskFn);
    }
    funcs
}

/// Groups a source iterator into non-empty chunks of up to `size` items.
struct ChunkedSource<I> {
    inner: I,
    size: usize,
}

impl<I: Iterator> Iterator for ChunkedSource<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Vec<I::Item>> {
        let chunk: Vec<I::Item> = self.inner.by_ref().take(self.size).collect();
        if chunk.is_empty() { None } else { Some(chunk) }
    }
}

/// Wraps a task-function source so a panicking iterator still fails the job
/// instead of wedging it: the panic becomes one terminal task whose function
/// returns the captured payload as an error.
struct GuardedTasks<I> {
    job: u64,
    next_index: u64,
    inner: Option<I>,
}

impl<I> GuardedTasks<I> {
    fn new(job: u64, inner: I) -> Self {
        Self {
            job,
            next_index: 0,
            inner: Some(inner),
        }
    }
}

impl<I: Iterator<Item = TaskFn>> Iterator for GuardedTasks<I> {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        let inner = self.inner.as_mut()?;
        let func = match catch_unwind(AssertUnwindSafe(|| inner.next())) {
            Ok(Some(func)) => func,
            Ok(None) => {
                self.inner = None;
                return None;
            }
            Err(payload) => {
                self.inner = None;
                let message = panic_message(payload);
                Box::new(move || Err(TaskError::Panic { message })) as TaskFn
            }
        };
        let task = Task {
            job: self.job,
            index: self.next_index,
            func,
        };
        self.next_index += 1;
        Some(task)
    }
}

async fn run_supervisor(shared: Arc<PoolShared>) {
    loop {
        let state = shared.supervisor_state.get();
        let keep_going = state == PoolState::Run
            || (!shared.cache.is_empty() && state != PoolState::Terminate);
        if !keep_going {
            break;
        }
        maintain_workers(&shared).await;
        tokio::time::sleep(SUPERVISOR_TICK).await;
    }
    // No more work can arrive; stop the dispatcher.
    debug!("worker supervisor exiting");
    let _ = shared.submission_tx.send(None);
}

async fn maintain_workers(shared: &Arc<PoolShared>) {
    let mut reaped = Vec::new();
    {
        let mut workers = lock(&shared.workers);
        for i in (0..workers.len()).rev() {
            if workers[i].join.is_finished() {
                debug!(slot = i, "cleaning up exited worker");
                reaped.push(workers.remove(i));
            }
        }
    }
    if reaped.is_empty() {
        return;
    }
    for worker in reaped {
        if let Err(err) = worker.join.await {
            error!("worker task ended abnormally: {err}");
        }
    }
    repopulate(shared);
}

fn repopulate(shared: &Arc<PoolShared>) {
    let mut workers = lock(&shared.workers);
    while workers.len() < shared.target_workers {
        workers.push(spawn_worker(shared));
        debug!("added worker");
    }
}

fn spawn_worker(shared: &Arc<PoolShared>) -> WorkerSlot {
    shared.spawned_total.fetch_add(1, Ordering::Relaxed);
    let ctx = WorkerContext {
        input: shared.input_rx.clone(),
        output: shared.output_tx.clone(),
        initializer: shared.initializer.clone(),
        max_tasks: shared.max_tasks,
    };
    WorkerSlot {
        join: tokio::spawn(run_worker(ctx)),
    }
}

async fn run_dispatcher(
    shared: Arc<PoolShared>,
    mut submissions: mpsc::UnboundedReceiver<Option<SubmitBatch>>,
) {
    'batches: loop {
        let batch = match submissions.recv().await {
            None => break,
            Some(None) => {
                debug!("task dispatcher got sentinel");
                break;
            }
            Some(Some(batch)) => batch,
        };
        let SubmitBatch {
            mut tasks,
            length_sink,
        } = batch;

        let mut sent = 0u64;
        while let Some(task) = tasks.next() {
            if shared.dispatcher_state.get() != PoolState::Run {
                debug!("task dispatcher observed shutdown mid-batch");
                // Release a partially submitted streaming job with the
                // truncated length so its consumer can terminate.
                if let Some(sink) = length_sink.as_deref() {
                    sink.set_length(sent);
                }
                break 'batches;
            }
            let (job, index) = (task.job, task.index);
            if shared.input_tx.send(Some(task)).is_err() {
                if let Some(handle) = shared.cache.get(job) {
                    handle.complete(
                        index,
                        Err(TaskError::Rejected {
                            message: "input queue closed".to_string(),
                        }),
                    );
                }
            }
            sent = index + 1;
        }
        if let Some(sink) = length_sink.as_deref() {
            debug!(length = sent, "task dispatcher setting job length");
            sink.set_length(sent);
        }
    }

    debug!("task dispatcher sending sentinel to result demultiplexer");
    let _ = shared.output_tx.send(None);
    let workers = lock(&shared.workers).len();
    debug!(workers, "task dispatcher sending sentinels to workers");
    for _ in 0..workers {
        let _ = shared.input_tx.send(None);
    }
    debug!("task dispatcher exiting");
}

async fn run_results(
    shared: Arc<PoolShared>,
    mut output: mpsc::UnboundedReceiver<Option<ResultEnvelope>>,
) {
    loop {
        let message = output.recv().await;
        if shared.result_state.get() == PoolState::Terminate {
            debug!("result demultiplexer observed terminate");
            return;
        }
        match message {
            None => {
                debug!("result demultiplexer output queue closed");
                return;
            }
            Some(None) => {
                debug!("result demultiplexer got sentinel");
                break;
            }
            Some(Some(envelope)) => route(&shared, envelope),
        }
    }

    // Drain until every outstanding handle has been satisfied.
    while !shared.cache.is_empty() && shared.result_state.get() != PoolState::Terminate {
        match output.recv().await {
            None => {
                debug!("result demultiplexer output queue closed while draining");
                return;
            }
            Some(None) => debug!("result demultiplexer ignoring extra sentinel"),
            Some(Some(envelope)) => route(&shared, envelope),
        }
    }
    debug!(
        outstanding = shared.cache.len(),
        "result demultiplexer exiting"
    );
}

fn route(shared: &PoolShared, envelope: ResultEnvelope) {
    match shared.cache.get(envelope.job) {
        Some(handle) => handle.complete(envelope.index, envelope.outcome),
        None => debug!(job = envelope.job, "dropping result for a finished job"),
    }
}
