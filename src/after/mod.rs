//! Post-response deferred tasks.
//!
//! Request handlers call [`after`] (or [`AfterContext::schedule`]) to register
//! work that must only run once the response has been fully sent:
//!
//! - an [`AfterTask::Eventual`] future is handed straight to the host's
//!   [`LifetimeExtender`] so the request stays alive until it settles;
//! - an [`AfterTask::Deferred`] procedure is queued, paused, and only started
//!   when the host reports the response closed.
//!
//! Deferred procedures run under the ambient context captured when they were
//! scheduled, plus a [`CallerChainRecord`] describing where they came from.
//! Their failures never reach the scheduling code (it returned long ago) and
//! are routed to the [`ErrorReporter`] instead.
//!
//! ## Lifecycle
//!
//! ```text
//! Collecting --first deferred task--> Armed --close--> Draining --queue idle--> Idle
//! ```
//!
//! Deferred tasks scheduled while draining extend the same drain. A response
//! that never closes, or a drain that fails, leaves the coordinator
//! [`AfterState::Abandoned`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::background::{CallbackQueue, DeferredJob};
use crate::context::{self, ContextSnapshot, Phase, WorkStore, WorkUnitId, WorkUnitStore};
use crate::host::{CloseNotifier, LifetimeExtender, LogRevalidations, RevalidationTracker};

pub mod chain;
pub mod config;
pub mod report;
pub mod stitch;

pub use chain::{CallerChainRecord, CallerInfo, CallerStack};
pub use config::AfterConfig;
pub use report::{ErrorReporter, TaskError, TaskErrorHook, TaskFailure, TaskKind};
pub use stitch::{StitchError, StitchedError};

/// Errors returned synchronously when scheduling a task.
#[derive(Debug, Error)]
pub enum AfterError {
    /// [`after`] was called with no [`AfterContext`] in scope.
    #[error("after() was called outside a request scope")]
    OutsideRequestScope,

    /// The host did not provide a [`LifetimeExtender`].
    #[error("after() is unavailable: the host cannot extend the request lifetime")]
    LifetimeUnavailable,
}

impl AfterError {
    /// Returns `true` for errors caused by how `after` was called.
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::OutsideRequestScope)
    }

    /// Returns `true` for errors caused by how the host was set up.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::LifetimeUnavailable)
    }
}

/// Broken host wiring detected while draining. Unrecoverable.
#[derive(Debug, Error)]
pub enum DrainError {
    #[error("no request context is in scope while running after() tasks")]
    MissingWorkStore,
}

/// A zero-argument deferred procedure.
pub type Procedure =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), TaskError>> + Send + 'static>;

/// Work handed to [`after`].
pub enum AfterTask {
    /// A future that is already meaningful on its own; it is driven right
    /// away and only its failure is observed.
    Eventual(BoxFuture<'static, Result<(), TaskError>>),
    /// A procedure that must not start before the response has closed.
    Deferred(Procedure),
}

impl AfterTask {
    /// Wraps a future whose outcome should be observed after the response.
    pub fn eventual<F, E>(fut: F) -> Self
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<TaskError>,
    {
        Self::Eventual(async move { fut.await.map_err(Into::<TaskError>::into) }.boxed())
    }

    /// Wraps an async procedure to run after the response has closed.
    pub fn deferred<C, F, E>(callback: C) -> Self
    where
        C: FnOnce() -> F + Send + 'static,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<TaskError>,
    {
        Self::Deferred(Box::new(move || {
            async move { callback().await.map_err(Into::<TaskError>::into) }.boxed()
        }))
    }

    /// Wraps a synchronous procedure to run after the response has closed.
    pub fn deferred_sync<C, E>(callback: C) -> Self
    where
        C: FnOnce() -> Result<(), E> + Send + 'static,
        E: Into<TaskError>,
    {
        Self::Deferred(Box::new(move || {
            async move { callback().map_err(Into::<TaskError>::into) }.boxed()
        }))
    }

    /// The kind reported if this task fails.
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Eventual(_) => TaskKind::Eventual,
            Self::Deferred(_) => TaskKind::Function,
        }
    }
}

impl fmt::Debug for AfterTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AfterTask").field(&self.kind()).finish()
    }
}

/// Where an [`AfterContext`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AfterState {
    /// Accepting tasks; nothing is waiting for the close yet.
    Collecting,
    /// A deferred task exists and the close is being awaited.
    Armed,
    /// The response closed and the queue is running.
    Draining,
    /// The queue ran empty.
    Idle,
    /// The response never closed or the drain failed. Deferred work
    /// scheduled from now on is discarded.
    Abandoned,
}

/// Host wiring and settings for one [`AfterContext`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rttp_after::after::{AfterConfig, AfterContext, AfterOptions};
/// use rttp_after::host::{CloseSignal, WaitUntil};
///
/// let (signal, _handle) = CloseSignal::new();
/// let options = AfterOptions::new(Arc::new(signal))
///     .wait_until(Arc::new(WaitUntil::new()))
///     .on_task_error(|failure| eprintln!("after() task failed: {failure}"))
///     .config(AfterConfig::default());
/// let after = AfterContext::new(options);
/// ```
pub struct AfterOptions {
    on_close: Arc<dyn CloseNotifier>,
    wait_until: Option<Arc<dyn LifetimeExtender>>,
    on_task_error: Option<TaskErrorHook>,
    revalidation: Arc<dyn RevalidationTracker>,
    config: AfterConfig,
}

impl AfterOptions {
    /// Starts from the one mandatory collaborator, the close notifier.
    pub fn new(on_close: Arc<dyn CloseNotifier>) -> Self {
        Self {
            on_close,
            wait_until: None,
            on_task_error: None,
            revalidation: Arc::new(LogRevalidations),
            config: AfterConfig::default(),
        }
    }

    /// Sets the lifetime extender. Without one, every scheduling attempt
    /// fails with [`AfterError::LifetimeUnavailable`].
    #[must_use]
    pub fn wait_until(mut self, extender: Arc<dyn LifetimeExtender>) -> Self {
        self.wait_until = Some(extender);
        self
    }

    /// Sets the hook invoked with every task failure.
    #[must_use]
    pub fn on_task_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TaskFailure) + Send + Sync + 'static,
    {
        self.on_task_error = Some(Arc::new(hook));
        self
    }

    /// Sets the tracker that applies revalidations recorded by deferred work.
    #[must_use]
    pub fn revalidation(mut self, tracker: Arc<dyn RevalidationTracker>) -> Self {
        self.revalidation = tracker;
        self
    }

    /// Sets the scheduler configuration.
    #[must_use]
    pub fn config(mut self, config: AfterConfig) -> Self {
        self.config = config;
        self
    }
}

struct Inner {
    on_close: Arc<dyn CloseNotifier>,
    wait_until: Option<Arc<dyn LifetimeExtender>>,
    revalidation: Arc<dyn RevalidationTracker>,
    reporter: ErrorReporter,
    queue: CallbackQueue,
    // Lock order: `observed` before `state`.
    observed: Mutex<HashMap<WorkUnitId, Arc<WorkUnitStore>>>,
    state: Mutex<AfterState>,
}

/// Per-request coordinator for post-response work.
///
/// Cloning yields another handle to the same coordinator.
#[derive(Clone)]
pub struct AfterContext {
    inner: Arc<Inner>,
}

impl AfterContext {
    /// Creates a coordinator in the [`AfterState::Collecting`] state.
    pub fn new(options: AfterOptions) -> Self {
        let AfterOptions {
            on_close,
            wait_until,
            on_task_error,
            revalidation,
            config,
        } = options;

        Self {
            inner: Arc::new(Inner {
                on_close,
                wait_until,
                revalidation,
                reporter: ErrorReporter::new(
                    on_task_error,
                    config.stitch_errors,
                    config.max_stitch_depth,
                ),
                queue: CallbackQueue::with_limit(config.max_concurrency),
                observed: Mutex::new(HashMap::new()),
                state: Mutex::new(AfterState::Collecting),
            }),
        }
    }

    /// Schedules `task`, recording the caller's location for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`AfterError::LifetimeUnavailable`] if no lifetime extender is
    /// configured. Nothing is queued in that case.
    #[track_caller]
    pub fn schedule(&self, task: AfterTask) -> Result<(), AfterError> {
        self.schedule_with_caller(task, CallerInfo::capture())
    }

    /// Schedules `task` with explicitly supplied caller information.
    ///
    /// # Errors
    ///
    /// See [`schedule`](Self::schedule).
    pub fn schedule_with_caller(&self, task: AfterTask, caller: CallerInfo) -> Result<(), AfterError> {
        match task {
            AfterTask::Eventual(fut) => self.add_eventual(fut, caller),
            AfterTask::Deferred(procedure) => self.enqueue(procedure, caller),
        }
    }

    /// Runs `fut` with this coordinator available to [`after`].
    pub fn provide<F>(&self, fut: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        context::provide(Arc::new(self.clone()), fut)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AfterState {
        *self.inner.state.lock()
    }

    /// Number of deferred procedures pending or running.
    pub fn pending_tasks(&self) -> usize {
        self.inner.queue.len()
    }

    /// Number of distinct work units seen while scheduling deferred work.
    pub fn observed_work_units(&self) -> usize {
        self.inner.observed.lock().len()
    }

    fn extender(&self) -> Result<Arc<dyn LifetimeExtender>, AfterError> {
        self.inner
            .wait_until
            .clone()
            .ok_or(AfterError::LifetimeUnavailable)
    }

    fn add_eventual(
        &self,
        fut: BoxFuture<'static, Result<(), TaskError>>,
        caller: CallerInfo,
    ) -> Result<(), AfterError> {
        let extender = self.extender()?;
        let enclosing = context::current::<CallerChainRecord>();
        let spawn_phase = context::current::<WorkUnitStore>().map(|unit| unit.phase());
        let reporter = self.inner.reporter.clone();

        extender.extend_lifetime(Box::pin(async move {
            let failure = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => return,
                Ok(Err(err)) => TaskFailure::Error(err),
                Err(payload) => TaskFailure::from_panic(payload),
            };
            let chain = CallerChainRecord::for_call(enclosing.as_deref(), caller, spawn_phase);
            reporter.report(TaskKind::Eventual, failure, Some(&chain));
        }));
        Ok(())
    }

    fn enqueue(&self, procedure: Procedure, caller: CallerInfo) -> Result<(), AfterError> {
        let extender = self.extender()?;

        let snapshot = ContextSnapshot::capture();
        let work_unit = snapshot.get::<WorkUnitStore>();
        let spawn_phase = work_unit.as_ref().map(|unit| unit.phase());
        if let Some(unit) = work_unit {
            self.inner.observe(unit);
        }

        let origin = caller
            .caller_stack()
            .frames()
            .first()
            .cloned()
            .unwrap_or_default();
        let chain = Arc::new(CallerChainRecord::for_call(
            snapshot.get::<CallerChainRecord>().as_deref(),
            caller,
            spawn_phase,
        ));
        debug!(origin = %origin, depth = chain.depth(), "deferred task scheduled");

        let reporter = self.inner.reporter.clone();
        let scoped = snapshot.with(Arc::clone(&chain));
        let work = scoped.scope(async move {
            let outcome = AssertUnwindSafe(async move { procedure().await })
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(err)) => TaskFailure::Error(err),
                Err(payload) => TaskFailure::from_panic(payload),
            };
            reporter.report(TaskKind::Function, failure, Some(&chain));
        });

        self.inner.queue.push(DeferredJob::new(origin, Box::pin(work)));
        self.arm(extender);
        Ok(())
    }

    fn arm(&self, extender: Arc<dyn LifetimeExtender>) {
        let mut state = self.inner.state.lock();
        match *state {
            AfterState::Collecting => {
                *state = AfterState::Armed;
                drop(state);

                let (closed_tx, closed_rx) = oneshot::channel::<()>();
                self.inner.on_close.on_close(Box::new(move || {
                    let _ = closed_tx.send(());
                }));

                let inner = Arc::clone(&self.inner);
                let close_wait = ContextSnapshot::capture().scope(async move {
                    if closed_rx.await.is_err() {
                        let discarded = inner.abandon();
                        warn!(discarded, "response was never closed, after() tasks discarded");
                        return;
                    }
                    if let Err(err) = inner.drain().await {
                        let discarded = inner.abandon();
                        error!(error = %err, discarded, "after() drain aborted");
                        panic!("{err}");
                    }
                });
                extender.extend_lifetime(Box::pin(close_wait));
                debug!("after() armed, waiting for the response to close");
            }
            AfterState::Idle => {
                // The drain already finished; the queue runs the new task
                // immediately and the request has to stay alive for it.
                *state = AfterState::Draining;
                drop(state);

                let inner = Arc::clone(&self.inner);
                match context::current::<WorkStore>() {
                    Some(work_store) => {
                        let settle = Box::pin(async move { inner.settle().await });
                        extender.extend_lifetime(self.inner.revalidation.track(work_store, settle));
                    }
                    None => extender.extend_lifetime(Box::pin(async move {
                        inner.settle().await;
                        let err = DrainError::MissingWorkStore;
                        error!(error = %err, "late after() task ran without request context");
                        panic!("{err}");
                    })),
                }
            }
            AfterState::Abandoned => {
                drop(state);
                let discarded = self.inner.queue.clear();
                warn!(discarded, "after() is no longer draining for this request, task discarded");
            }
            AfterState::Armed | AfterState::Draining => {}
        }
    }
}

impl Inner {
    fn observe(&self, unit: Arc<WorkUnitStore>) {
        let mut observed = self.observed.lock();
        if matches!(*self.state.lock(), AfterState::Draining | AfterState::Idle) {
            unit.set_phase(Phase::After);
        }
        observed.entry(unit.id()).or_insert(unit);
    }

    /// Moves to [`AfterState::Abandoned`] and drops every job that never ran.
    fn abandon(&self) -> usize {
        *self.state.lock() = AfterState::Abandoned;
        self.queue.clear()
    }

    async fn drain(self: &Arc<Self>) -> Result<(), DrainError> {
        if self.queue.is_empty() {
            *self.state.lock() = AfterState::Idle;
            return Ok(());
        }

        {
            let observed = self.observed.lock();
            *self.state.lock() = AfterState::Draining;
            for unit in observed.values() {
                unit.set_phase(Phase::After);
            }
        }

        let work_store = context::current::<WorkStore>().ok_or(DrainError::MissingWorkStore)?;
        debug!(
            route = %work_store.route(),
            tasks = self.queue.len(),
            "response closed, running after() tasks"
        );

        let inner = Arc::clone(self);
        self.revalidation
            .track(
                work_store,
                Box::pin(async move {
                    inner.queue.start();
                    inner.settle().await;
                }),
            )
            .await;
        Ok(())
    }

    /// Waits until the queue is idle and moves to [`AfterState::Idle`].
    ///
    /// A task pushed between the queue going idle and the state change is
    /// picked up by the next round instead of being left unawaited.
    async fn settle(&self) {
        loop {
            self.queue.on_idle().await;
            let settled = {
                let mut state = self.state.lock();
                let idle = self.queue.is_empty();
                if idle {
                    *state = AfterState::Idle;
                }
                idle
            };
            if settled {
                debug!("after() tasks finished");
                return;
            }
        }
    }
}

impl fmt::Debug for AfterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfterContext")
            .field("state", &self.state())
            .field("pending_tasks", &self.pending_tasks())
            .field("observed_work_units", &self.observed_work_units())
            .finish()
    }
}

/// Schedules `task` on the [`AfterContext`] of the current request.
///
/// # Errors
///
/// - [`AfterError::OutsideRequestScope`] — no request is in scope.
/// - [`AfterError::LifetimeUnavailable`] — the host cannot extend the
///   request lifetime.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_after::after::{after, AfterTask};
///
/// async fn handler() -> &'static str {
///     after(AfterTask::deferred(|| async {
///         // runs once the response has been sent
///         Ok::<_, std::io::Error>(())
///     }))
///     .expect("request scope");
///     "ok"
/// }
/// ```
#[track_caller]
pub fn after(task: AfterTask) -> Result<(), AfterError> {
    let caller = CallerInfo::capture();
    let after = context::current::<AfterContext>().ok_or(AfterError::OutsideRequestScope)?;
    after.schedule_with_caller(task, caller)
}
