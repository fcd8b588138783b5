use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::error;

use crate::error::{PoolError, TaskError};
use crate::worker::TaskOutcome;

/// Process-wide monotonic job counter.
static JOB_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_job_id() -> u64 {
    JOB_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Locks a mutex, ignoring poisoning from a panicked holder.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sink side of a job handle: receives results routed by the demultiplexer
/// and the final item count set by the dispatcher.
pub(crate) trait ResultSink: Send + Sync {
    fn complete(&self, index: u64, outcome: TaskOutcome);
    fn set_length(&self, length: u64);
}

/// Registry of outstanding jobs, keyed by job id. A job stays registered
/// exactly until its handle observes completion.
pub(crate) struct JobCache {
    jobs: Mutex<HashMap<u64, Arc<dyn ResultSink>>>,
}

impl JobCache {
    pub(crate) fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, job: u64, sink: Arc<dyn ResultSink>) {
        lock(&self.jobs).insert(job, sink);
    }

    pub(crate) fn get(&self, job: u64) -> Option<Arc<dyn ResultSink>> {
        lock(&self.jobs).get(&job).cloned()
    }

    pub(crate) fn remove(&self, job: u64) {
        lock(&self.jobs).remove(&job);
    }

    pub(crate) fn is_empty(&self) -> bool {
        lock(&self.jobs).is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.jobs).len()
    }
}

/// One-shot completion event.
struct Event {
    set: AtomicBool,
    notify: Notify,
}

impl Event {
    fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn set(&self) {
        self.set.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            // Register before checking, so a notify between the check and
            // the await cannot be missed.
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

type SuccessCallback<R> = Box<dyn Fn(&R) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&TaskError) + Send + Sync>;

/// Completion callbacks attached to a submission.
///
/// Both callbacks are best-effort notifications: they run on the
/// demultiplexer's thread of control, and a panic inside one is contained
/// and logged rather than propagated into the pool.
pub struct Callbacks<R> {
    on_success: Option<SuccessCallback<R>>,
    on_error: Option<ErrorCallback>,
}

impl<R> Default for Callbacks<R> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
        }
    }
}

impl<R> Callbacks<R> {
    /// Creates an empty callback set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked with the job's value when it completes successfully.
    pub fn on_success(mut self, callback: impl Fn(&R) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Invoked with the job's error when it fails.
    pub fn on_error(mut self, callback: impl Fn(&TaskError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    fn fire_success(&self, value: &R) {
        if let Some(callback) = &self.on_success {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                error!("success callback panicked");
            }
        }
    }

    fn fire_error(&self, err: &TaskError) {
        if let Some(callback) = &self.on_error {
            if catch_unwind(AssertUnwindSafe(|| callback(err))).is_err() {
                error!("error callback panicked");
            }
        }
    }
}

fn downcast<R: 'static>(outcome: TaskOutcome) -> Result<R, TaskError> {
    outcome.and_then(|payload| {
        payload
            .downcast::<R>()
            .map(|boxed| *boxed)
            .map_err(|_| TaskError::TypeMismatch)
    })
}

enum Completion<R> {
    Pending,
    Success(Option<R>),
    Failure(TaskError),
}

struct ApplyShared<R> {
    job: u64,
    cache: Arc<JobCache>,
    event: Event,
    succeeded: AtomicBool,
    value: Mutex<Completion<R>>,
    callbacks: Callbacks<R>,
}

/// Handle for a single `apply_async` submission.
///
/// The success value moves out of the handle on the first successful call to
/// [`get`](Self::get); errors are re-reported on every call.
pub struct ApplyHandle<R> {
    shared: Arc<ApplyShared<R>>,
}

/// Alias kept for call sites that read better as "async result".
pub type AsyncHandle<R> = ApplyHandle<R>;

impl<R: Send + 'static> ApplyHandle<R> {
    pub(crate) fn new(cache: &Arc<JobCache>, callbacks: Callbacks<R>) -> Self {
        let shared = Arc::new(ApplyShared {
            job: next_job_id(),
            cache: cache.clone(),
            event: Event::new(),
            succeeded: AtomicBool::new(false),
            value: Mutex::new(Completion::Pending),
            callbacks,
        });
        cache.register(shared.job, shared.clone());
        Self { shared }
    }

    pub(crate) fn job(&self) -> u64 {
        self.shared.job
    }

    /// Whether the job has completed (successfully or not).
    pub fn ready(&self) -> bool {
        self.shared.event.is_set()
    }

    /// Whether the job succeeded. Only valid once [`ready`](Self::ready).
    pub fn successful(&self) -> Result<bool, PoolError> {
        if !self.ready() {
            return Err(PoolError::NotReady);
        }
        Ok(self.shared.succeeded.load(Ordering::Acquire))
    }

    /// Waits until the job completes.
    pub async fn wait(&self) {
        self.shared.event.wait().await;
    }

    /// Waits until the job completes or `timeout` elapses.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), PoolError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| PoolError::Timeout)
    }

    /// Waits for completion and returns the value, re-raising a stored error.
    pub async fn get(&self) -> Result<R, PoolError> {
        self.wait().await;
        self.take()
    }

    /// Like [`get`](Self::get), but fails with [`PoolError::Timeout`] if the
    /// job does not complete in time. The job itself is not cancelled and the
    /// call may be retried.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<R, PoolError> {
        self.wait_timeout(timeout).await?;
        self.take()
    }

    fn take(&self) -> Result<R, PoolError> {
        match &mut *lock(&self.shared.value) {
            Completion::Pending => Err(PoolError::NotReady),
            Completion::Success(value) => value.take().ok_or(PoolError::ResultTaken),
            Completion::Failure(err) => Err(PoolError::Task(err.clone())),
        }
    }
}

impl<R: Send + 'static> ResultSink for ApplyShared<R> {
    fn complete(&self, _index: u64, outcome: TaskOutcome) {
        let completion = match downcast::<R>(outcome) {
            Ok(value) => {
                self.callbacks.fire_success(&value);
                self.succeeded.store(true, Ordering::Release);
                Completion::Success(Some(value))
            }
            Err(err) => {
                self.callbacks.fire_error(&err);
                Completion::Failure(err)
            }
        };
        *lock(&self.value) = completion;
        // Removal must precede the event so a ready handle is never cached.
        self.cache.remove(self.job);
        self.event.set();
    }

    fn set_length(&self, _length: u64) {}
}

struct MapState<R> {
    remaining: usize,
    ok: bool,
    slots: Vec<Option<R>>,
    error: Option<TaskError>,
    value: Option<Vec<R>>,
}

struct MapShared<R> {
    job: u64,
    cache: Arc<JobCache>,
    event: Event,
    succeeded: AtomicBool,
    chunksize: usize,
    callbacks: Callbacks<Vec<R>>,
    state: Mutex<MapState<R>>,
}

/// Handle aggregating the chunked sub-results of a `map_async` or
/// `starmap_async` submission into one ordered output vector.
pub struct MapHandle<R> {
    shared: Arc<MapShared<R>>,
}

impl<R: Send + 'static> MapHandle<R> {
    pub(crate) fn new(
        cache: &Arc<JobCache>,
        chunksize: usize,
        length: usize,
        callbacks: Callbacks<Vec<R>>,
    ) -> Self {
        let expected = if chunksize == 0 {
            0
        } else {
            length / chunksize + usize::from(length % chunksize != 0)
        };
        let shared = Arc::new(MapShared {
            job: next_job_id(),
            cache: cache.clone(),
            event: Event::new(),
            succeeded: AtomicBool::new(expected == 0),
            chunksize,
            callbacks,
            state: Mutex::new(MapState {
                remaining: expected,
                ok: true,
                slots: (0..length).map(|_| None).collect(),
                error: None,
                value: if expected == 0 { Some(Vec::new()) } else { None },
            }),
        });
        if expected == 0 {
            shared.event.set();
        } else {
            cache.register(shared.job, shared.clone());
        }
        Self { shared }
    }

    pub(crate) fn job(&self) -> u64 {
        self.shared.job
    }

    /// Whether every chunk has been accounted for.
    pub fn ready(&self) -> bool {
        self.shared.event.is_set()
    }

    /// Whether the whole map succeeded. Only valid once [`ready`](Self::ready).
    pub fn successful(&self) -> Result<bool, PoolError> {
        if !self.ready() {
            return Err(PoolError::NotReady);
        }
        Ok(self.shared.succeeded.load(Ordering::Acquire))
    }

    /// Waits until every chunk has been accounted for.
    pub async fn wait(&self) {
        self.shared.event.wait().await;
    }

    /// Waits until completion or `timeout` elapses.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), PoolError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| PoolError::Timeout)
    }

    /// Waits for completion and returns the ordered outputs, re-raising the
    /// first failure observed across the chunks.
    pub async fn get(&self) -> Result<Vec<R>, PoolError> {
        self.wait().await;
        self.take()
    }

    /// Like [`get`](Self::get), but bounded by `timeout`.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<Vec<R>, PoolError> {
        self.wait_timeout(timeout).await?;
        self.take()
    }

    fn take(&self) -> Result<Vec<R>, PoolError> {
        let mut state = lock(&self.shared.state);
        if self.shared.succeeded.load(Ordering::Acquire) {
            state.value.take().ok_or(PoolError::ResultTaken)
        } else {
            match &state.error {
                Some(err) => Err(PoolError::Task(err.clone())),
                None => Err(PoolError::NotReady),
            }
        }
    }
}

impl<R: Send + 'static> ResultSink for MapShared<R> {
    fn complete(&self, index: u64, outcome: TaskOutcome) {
        let finished = {
            let mut state = lock(&self.state);
            state.remaining = state.remaining.saturating_sub(1);
            match downcast::<Vec<R>>(outcome) {
                Ok(chunk) if state.ok => {
                    let offset = index as usize * self.chunksize;
                    for (i, value) in chunk.into_iter().enumerate() {
                        if let Some(slot) = state.slots.get_mut(offset + i) {
                            *slot = Some(value);
                        }
                    }
                }
                // A late success after the first failure is discarded.
                Ok(_) => {}
                Err(err) => {
                    if state.ok {
                        state.ok = false;
                        state.error = Some(err);
                    }
                }
            }
            if state.remaining > 0 {
                None
            } else if state.ok {
                Some(Ok(state.slots.drain(..).flatten().collect::<Vec<R>>()))
            } else {
                Some(Err(state.error.take().unwrap_or(TaskError::TypeMismatch)))
            }
        };

        let Some(result) = finished else { return };
        match result {
            Ok(values) => {
                self.callbacks.fire_success(&values);
                self.succeeded.store(true, Ordering::Release);
                lock(&self.state).value = Some(values);
            }
            Err(err) => {
                self.callbacks.fire_error(&err);
                lock(&self.state).error = Some(err);
            }
        }
        self.cache.remove(self.job);
        self.event.set();
    }

    fn set_length(&self, _length: u64) {}
}

struct StreamState {
    items: VecDeque<TaskOutcome>,
    index: u64,
    length: Option<u64>,
    unsorted: HashMap<u64, TaskOutcome>,
}

struct StreamShared {
    job: u64,
    cache: Arc<JobCache>,
    ordered: bool,
    notify: Notify,
    state: Mutex<StreamState>,
}

impl StreamShared {
    fn done(state: &StreamState) -> bool {
        state.length == Some(state.index)
    }
}

impl ResultSink for StreamShared {
    fn complete(&self, index: u64, outcome: TaskOutcome) {
        let done = {
            let mut state = lock(&self.state);
            if self.ordered {
                if state.index == index {
                    state.items.push_back(outcome);
                    state.index += 1;
                    loop {
                        let key = state.index;
                        match state.unsorted.remove(&key) {
                            Some(next) => {
                                state.items.push_back(next);
                                state.index += 1;
                            }
                            None => break,
                        }
                    }
                } else {
                    state.unsorted.insert(index, outcome);
                }
            } else {
                state.items.push_back(outcome);
                state.index += 1;
            }
            Self::done(&state)
        };
        self.notify.notify_waiters();
        if done {
            self.cache.remove(self.job);
        }
    }

    fn set_length(&self, length: u64) {
        let done = {
            let mut state = lock(&self.state);
            state.length = Some(length);
            Self::done(&state)
        };
        self.notify.notify_waiters();
        if done {
            self.cache.remove(self.job);
        }
    }
}

enum Pull {
    Item(TaskOutcome),
    End,
}

/// Lazy stream over the results of `imap` (index order) or `imap_unordered`
/// (arrival order).
///
/// The stream ends once the dispatcher has reported the total item count and
/// every item has been delivered.
pub struct ResultStream<R> {
    shared: Arc<StreamShared>,
    ready: VecDeque<R>,
    chunked: bool,
}

impl<R: Send + 'static> ResultStream<R> {
    pub(crate) fn new(cache: &Arc<JobCache>, ordered: bool, chunked: bool) -> Self {
        let shared = Arc::new(StreamShared {
            job: next_job_id(),
            cache: cache.clone(),
            ordered,
            notify: Notify::new(),
            state: Mutex::new(StreamState {
                items: VecDeque::new(),
                index: 0,
                length: None,
                unsorted: HashMap::new(),
            }),
        });
        cache.register(shared.job, shared.clone());
        Self {
            shared,
            ready: VecDeque::new(),
            chunked,
        }
    }

    pub(crate) fn job(&self) -> u64 {
        self.shared.job
    }

    pub(crate) fn sink(&self) -> Arc<dyn ResultSink> {
        self.shared.clone()
    }

    /// Next result, in stream order. Returns `None` once the stream is
    /// exhausted. A task failure is yielded in place of its value; iteration
    /// may continue past it.
    pub async fn next(&mut self) -> Option<Result<R, PoolError>> {
        loop {
            if let Some(value) = self.ready.pop_front() {
                return Some(Ok(value));
            }
            let item = match self.pull(None).await {
                Ok(Pull::Item(item)) => item,
                Ok(Pull::End) => return None,
                Err(err) => return Some(Err(err)),
            };
            if let Some(result) = self.absorb(item) {
                return Some(result);
            }
        }
    }

    /// Like [`next`](Self::next), but yields `Err(PoolError::Timeout)` if no
    /// item arrives within `timeout`. The stream stays usable afterwards.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Option<Result<R, PoolError>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(value) = self.ready.pop_front() {
                return Some(Ok(value));
            }
            let item = match self.pull(Some(deadline)).await {
                Ok(Pull::Item(item)) => item,
                Ok(Pull::End) => return None,
                Err(err) => return Some(Err(err)),
            };
            if let Some(result) = self.absorb(item) {
                return Some(result);
            }
        }
    }

    /// Drains the stream into a vector, stopping at the first failure.
    pub async fn collect(mut self) -> Result<Vec<R>, PoolError> {
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }

    async fn pull(&self, deadline: Option<tokio::time::Instant>) -> Result<Pull, PoolError> {
        loop {
            let mut notified = std::pin::pin!(self.shared.notify.notified());
            // Register before checking, so a notify between the check and
            // the await cannot be missed.
            notified.as_mut().enable();
            {
                let mut state = lock(&self.shared.state);
                if let Some(item) = state.items.pop_front() {
                    return Ok(Pull::Item(item));
                }
                if StreamShared::done(&state) {
                    return Ok(Pull::End);
                }
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(PoolError::Timeout);
                    }
                }
            }
        }
    }

    fn absorb(&mut self, item: TaskOutcome) -> Option<Result<R, PoolError>> {
        match item {
            Err(err) => Some(Err(err.into())),
            Ok(payload) => {
                if self.chunked {
                    match payload.downcast::<Vec<R>>() {
                        Ok(chunk) => {
                            self.ready.extend(*chunk);
                            None
                        }
                        Err(_) => Some(Err(TaskError::TypeMismatch.into())),
                    }
                } else {
                    match payload.downcast::<R>() {
                        Ok(value) => Some(Ok(*value)),
                        Err(_) => Some(Err(TaskError::TypeMismatch.into())),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::{
        ApplyHandle, Callbacks, JobCache, MapHandle, ResultSink, ResultStream, next_job_id,
    };
    use crate::error::{PoolError, TaskError};
    use crate::worker::{TaskOutcome, TaskPayload};

    fn ok<R: Send + 'static>(value: R) -> TaskOutcome {
        Ok(Box::new(value) as TaskPayload)
    }

    fn failed(message: &str) -> TaskOutcome {
        Err(TaskError::Panic {
            message: message.to_string(),
        })
    }

    #[test]
    fn job_ids_are_strictly_increasing() {
        let a = next_job_id();
        let b = next_job_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn apply_handle_reports_success() {
        let cache = Arc::new(JobCache::new());
        let handle: ApplyHandle<i32> = ApplyHandle::new(&cache, Callbacks::new());
        assert!(!handle.ready());
        assert_eq!(handle.successful(), Err(PoolError::NotReady));
        assert_eq!(cache.len(), 1);

        handle.shared.complete(0, ok(7));

        assert!(handle.ready());
        assert_eq!(handle.successful(), Ok(true));
        assert!(cache.is_empty());
        assert_eq!(handle.get().await, Ok(7));
        assert_eq!(handle.get().await, Err(PoolError::ResultTaken));
    }

    #[tokio::test]
    async fn apply_handle_reraises_failure_every_time() {
        let cache = Arc::new(JobCache::new());
        let handle: ApplyHandle<i32> = ApplyHandle::new(&cache, Callbacks::new());
        handle.shared.complete(0, failed("bad"));

        assert_eq!(handle.successful(), Ok(false));
        for _ in 0..2 {
            assert_eq!(
                handle.get().await,
                Err(PoolError::Task(TaskError::Panic {
                    message: "bad".to_string()
                }))
            );
        }
    }

    #[tokio::test]
    async fn apply_callbacks_fire_and_contain_panics() {
        let cache = Arc::new(JobCache::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let callbacks = Callbacks::new()
            .on_success(move |value: &i32| {
                seen.fetch_add(*value as usize, Ordering::SeqCst);
                panic!("callback bug");
            })
            .on_error(|_| {});
        let handle: ApplyHandle<i32> = ApplyHandle::new(&cache, callbacks);

        handle.shared.complete(0, ok(3));

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(handle.get().await, Ok(3));
    }

    #[tokio::test]
    async fn wait_timeout_elapses_without_result() {
        let cache = Arc::new(JobCache::new());
        let handle: ApplyHandle<i32> = ApplyHandle::new(&cache, Callbacks::new());
        assert_eq!(
            handle.wait_timeout(Duration::from_millis(10)).await,
            Err(PoolError::Timeout)
        );
    }

    #[tokio::test]
    async fn map_handle_splices_chunks_in_index_order() {
        let cache = Arc::new(JobCache::new());
        let handle: MapHandle<i32> = MapHandle::new(&cache, 2, 5, Callbacks::new());

        // Chunks arrive out of order.
        handle.shared.complete(2, ok(vec![50]));
        handle.shared.complete(0, ok(vec![10, 20]));
        assert!(!handle.ready());
        handle.shared.complete(1, ok(vec![30, 40]));

        assert_eq!(handle.get().await, Ok(vec![10, 20, 30, 40, 50]));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn map_handle_latches_first_failure() {
        let cache = Arc::new(JobCache::new());
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        let callbacks = Callbacks::new().on_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let handle: MapHandle<i32> = MapHandle::new(&cache, 1, 3, callbacks);

        handle.shared.complete(0, ok(vec![1]));
        handle.shared.complete(1, failed("first"));
        handle.shared.complete(2, failed("second"));

        assert_eq!(handle.successful(), Ok(false));
        assert_eq!(
            handle.get().await,
            Err(PoolError::Task(TaskError::Panic {
                message: "first".to_string()
            }))
        );
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_map_is_immediately_ready() {
        let cache = Arc::new(JobCache::new());
        let handle: MapHandle<i32> = MapHandle::new(&cache, 0, 0, Callbacks::new());
        assert!(handle.ready());
        assert_eq!(handle.successful(), Ok(true));
        assert!(cache.is_empty());
        assert_eq!(handle.get().await, Ok(Vec::new()));
    }

    #[tokio::test]
    async fn ordered_stream_buffers_out_of_order_results() {
        let cache = Arc::new(JobCache::new());
        let mut stream: ResultStream<i32> = ResultStream::new(&cache, true, false);
        let sink = stream.sink();

        sink.complete(2, ok(30));
        sink.complete(0, ok(10));
        sink.complete(1, ok(20));
        sink.set_length(3);

        assert_eq!(stream.next().await, Some(Ok(10)));
        assert_eq!(stream.next().await, Some(Ok(20)));
        assert_eq!(stream.next().await, Some(Ok(30)));
        assert_eq!(stream.next().await, None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unordered_stream_delivers_in_arrival_order() {
        let cache = Arc::new(JobCache::new());
        let mut stream: ResultStream<i32> = ResultStream::new(&cache, false, false);
        let sink = stream.sink();

        sink.complete(2, ok(30));
        sink.complete(0, ok(10));
        sink.set_length(2);

        assert_eq!(stream.next().await, Some(Ok(30)));
        assert_eq!(stream.next().await, Some(Ok(10)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn empty_stream_terminates_on_length() {
        let cache = Arc::new(JobCache::new());
        let mut stream: ResultStream<i32> = ResultStream::new(&cache, true, false);
        stream.sink().set_length(0);
        assert_eq!(stream.next().await, None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn stream_next_times_out_and_recovers() {
        let cache = Arc::new(JobCache::new());
        let mut stream: ResultStream<i32> = ResultStream::new(&cache, true, false);
        assert_eq!(
            stream.next_timeout(Duration::from_millis(10)).await,
            Some(Err(PoolError::Timeout))
        );

        let sink = stream.sink();
        sink.complete(0, ok(1));
        sink.set_length(1);
        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn chunked_stream_flattens_chunk_payloads() {
        let cache = Arc::new(JobCache::new());
        let stream: ResultStream<i32> = ResultStream::new(&cache, true, true);
        let sink = stream.sink();

        sink.complete(0, ok(vec![1, 2, 3]));
        sink.complete(1, ok(vec![4]));
        sink.set_length(2);

        assert_eq!(stream.collect().await, Ok(vec![1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn stream_yields_failures_in_place() {
        let cache = Arc::new(JobCache::new());
        let mut stream: ResultStream<i32> = ResultStream::new(&cache, true, false);
        let sink = stream.sink();

        sink.complete(0, ok(1));
        sink.complete(1, failed("mid"));
        sink.complete(2, ok(3));
        sink.set_length(3);

        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(
            stream.next().await,
            Some(Err(PoolError::Task(TaskError::Panic {
                message: "mid".to_string()
            })))
        );
        assert_eq!(stream.next().await, Some(Ok(3)));
        assert_eq!(stream.next().await, None);
    }
}
