//! Background work — the pausable deferred-callback queue.
//!
//! [`CallbackQueue`] holds jobs until it is explicitly started, then launches
//! every queued job at once on the Tokio runtime. Jobs pushed after the start
//! are launched immediately. [`CallbackQueue::on_idle`] resolves once nothing is
//! pending or running, re-checking after every completion so jobs pushed from
//! inside running jobs are waited for as well.
//!
//! [`InFlight`] is the counter behind that idle signal; the host's
//! [`WaitUntil`](crate::host::WaitUntil) reuses it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

/// Identifier of a queued job, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        JobId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of deferred work plus the metadata used to trace it.
pub struct DeferredJob {
    id: JobId,
    origin: String,
    work: BoxFuture<'static, ()>,
}

impl DeferredJob {
    /// Wraps `work`; `origin` names where the job was scheduled from.
    pub fn new(origin: impl Into<String>, work: BoxFuture<'static, ()>) -> Self {
        Self {
            id: JobId::next(),
            origin: origin.into(),
            work,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl fmt::Debug for DeferredJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredJob")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Counts in-flight work and wakes waiters when the count returns to zero.
#[derive(Debug, Default)]
pub struct InFlight {
    count: Mutex<usize>,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one unit of work. The returned guard completes it on drop,
    /// including when the work unwinds.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock() += 1;
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Returns the number of units currently registered.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Resolves once the count is zero.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a zero crossing in between is not missed.
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn leave(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_waiters();
        }
    }
}

/// Completes one unit of [`InFlight`] work when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.leave();
    }
}

#[derive(Default)]
struct QueueState {
    started: bool,
    pending: VecDeque<DeferredJob>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    started: Notify,
    in_flight: Arc<InFlight>,
    limit: Option<Arc<Semaphore>>,
}

/// A pausable, start-once FIFO of deferred jobs.
///
/// Cloning a `CallbackQueue` yields another handle to the same queue.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use rttp_after::background::{CallbackQueue, DeferredJob};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let queue = CallbackQueue::new();
/// let ran = Arc::new(AtomicBool::new(false));
///
/// let flag = Arc::clone(&ran);
/// queue.push(DeferredJob::new("doc", Box::pin(async move {
///     flag.store(true, Ordering::SeqCst);
/// })));
/// assert_eq!(queue.len(), 1);
/// assert!(!ran.load(Ordering::SeqCst));
///
/// queue.start();
/// queue.on_idle().await;
/// assert!(ran.load(Ordering::SeqCst));
/// # }
/// ```
#[derive(Clone)]
pub struct CallbackQueue {
    inner: Arc<QueueInner>,
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackQueue {
    /// Creates a paused queue with no concurrency ceiling.
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Creates a paused queue that runs at most `limit` jobs at a time, or
    /// any number when `limit` is `None`.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                started: Notify::new(),
                in_flight: Arc::new(InFlight::new()),
                limit: limit.map(|permits| Arc::new(Semaphore::new(permits.max(1)))),
            }),
        }
    }

    /// Adds a job. Launches it right away if the queue has been started.
    ///
    /// Launching requires a Tokio runtime.
    pub fn push(&self, job: DeferredJob) {
        let mut state = self.inner.state.lock();
        if state.started {
            // Count the job before releasing the lock so a concurrent idle
            // check never sees a false zero.
            let guard = self.inner.in_flight.enter();
            drop(state);
            self.launch(job, guard);
        } else {
            debug!(job = %job.id, origin = %job.origin, "deferred job queued");
            state.pending.push_back(job);
        }
    }

    /// Starts the queue, launching every pending job in submission order.
    ///
    /// Calling `start` more than once has no further effect.
    pub fn start(&self) {
        let jobs: Vec<_> = {
            let mut state = self.inner.state.lock();
            if state.started {
                return;
            }
            state.started = true;
            std::mem::take(&mut state.pending)
                .into_iter()
                .map(|job| (job, self.inner.in_flight.enter()))
                .collect()
        };

        debug!(jobs = jobs.len(), "deferred queue started");
        for (job, guard) in jobs {
            self.launch(job, guard);
        }
        self.inner.started.notify_waiters();
    }

    /// Returns `true` once [`start`](Self::start) has been called.
    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    /// Returns the number of pending plus running jobs.
    pub fn len(&self) -> usize {
        let pending = self.inner.state.lock().pending.len();
        pending + self.inner.in_flight.count()
    }

    /// Returns `true` if no job is pending or running.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every job that has not been launched yet and returns how many
    /// were discarded.
    pub fn clear(&self) -> usize {
        let discarded = std::mem::take(&mut self.inner.state.lock().pending);
        if !discarded.is_empty() {
            warn!(jobs = discarded.len(), "discarding deferred jobs that never ran");
        }
        // Idle waiters parked on a paused queue re-check the now empty backlog.
        self.inner.started.notify_waiters();
        discarded.len()
    }

    /// Resolves once no job is pending or running.
    ///
    /// Jobs that are still paused keep this pending, so callers normally
    /// [`start`](Self::start) the queue first.
    pub async fn on_idle(&self) {
        loop {
            let started = self.inner.started.notified();
            tokio::pin!(started);
            started.as_mut().enable();

            // Paused jobs only become in-flight once the queue starts.
            if !self.inner.state.lock().pending.is_empty() {
                started.await;
                continue;
            }

            self.inner.in_flight.wait_idle().await;
            if self.inner.state.lock().pending.is_empty() {
                return;
            }
        }
    }

    fn launch(&self, job: DeferredJob, guard: InFlightGuard) {
        let DeferredJob { id, origin, work } = job;
        let limit = self.inner.limit.clone();

        debug!(job = %id, origin = %origin, "deferred job launched");
        tokio::spawn(async move {
            let _guard = guard;
            let _permit = match limit {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            work.await;
            debug!(job = %id, "deferred job finished");
        });
    }
}

impl fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CallbackQueue")
            .field("started", &state.started)
            .field("pending", &state.pending.len())
            .field("in_flight", &self.inner.in_flight.count())
            .finish()
    }
}
