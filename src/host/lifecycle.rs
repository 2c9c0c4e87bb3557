//! Per-request wiring of the scheduler to a Tokio host.
//!
//! One [`RequestLifecycle`] owns everything a single request needs: the
//! request-scoped [`WorkStore`], the handler's [`WorkUnitStore`], a
//! [`WaitUntil`] tracker, the close trigger and the [`AfterContext`].

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use super::{CloseHandle, CloseSignal, WaitUntil};
use crate::after::{AfterContext, AfterOptions};
use crate::context::{ContextSnapshot, Phase, WorkStore, WorkUnitStore};

/// Drives one request through respond → close → finished.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_after::after::{after, AfterTask};
/// use rttp_after::host::RequestLifecycle;
///
/// # #[tokio::main]
/// # async fn main() {
/// RequestLifecycle::new("/checkout")
///     .serve(
///         async {
///             after(AfterTask::deferred_sync(|| {
///                 println!("response already sent");
///                 Ok::<_, std::io::Error>(())
///             }))
///             .expect("request scope");
///             "ok"
///         },
///         |body| async move { println!("{body}") },
///     )
///     .await;
/// # }
/// ```
pub struct RequestLifecycle {
    work_store: Arc<WorkStore>,
    work_unit: Arc<WorkUnitStore>,
    wait_until: WaitUntil,
    close: CloseHandle,
    after: AfterContext,
}

impl RequestLifecycle {
    /// Creates the lifecycle for a request to `route` with default options.
    pub fn new(route: impl Into<String>) -> Self {
        Self::with_options(route, |options| options)
    }

    /// Creates the lifecycle, letting `configure` adjust the scheduler
    /// options (error hook, revalidation tracker, config).
    ///
    /// The options passed to `configure` already carry this lifecycle's
    /// close signal and [`WaitUntil`].
    pub fn with_options<C>(route: impl Into<String>, configure: C) -> Self
    where
        C: FnOnce(AfterOptions) -> AfterOptions,
    {
        let route = route.into();
        let wait_until = WaitUntil::new();
        let (signal, close) = CloseSignal::new();
        let options = configure(
            AfterOptions::new(Arc::new(signal)).wait_until(Arc::new(wait_until.clone())),
        );

        Self {
            work_unit: Arc::new(WorkUnitStore::new(route.clone(), Phase::Render)),
            work_store: Arc::new(WorkStore::new(route)),
            wait_until,
            close,
            after: AfterContext::new(options),
        }
    }

    /// The ambient context handlers of this request run under.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot::capture()
            .with(Arc::clone(&self.work_store))
            .with(Arc::clone(&self.work_unit))
            .with(Arc::new(self.after.clone()))
    }

    /// Runs `handler` inside this request's scope.
    pub async fn respond<F>(&self, handler: F) -> F::Output
    where
        F: Future,
    {
        debug!(route = %self.work_store.route(), "dispatching request");
        self.snapshot().scope(handler).await
    }

    /// Signals that the response has been fully sent.
    pub fn close(&self) {
        debug!(route = %self.work_store.route(), "response delivered");
        self.close.close();
    }

    /// Resolves once every piece of post-response work has settled.
    pub async fn finished(&self) {
        self.wait_until.wait().await;
        debug!(route = %self.work_store.route(), "request finished");
    }

    /// Runs `handler`, hands its output to `deliver`, closes the response and
    /// waits for all post-response work.
    pub async fn serve<F, D, Fut>(self, handler: F, deliver: D) -> Self
    where
        F: Future,
        D: FnOnce(F::Output) -> Fut,
        Fut: Future<Output = ()>,
    {
        let response = self.respond(handler).await;
        deliver(response).await;
        self.close();
        self.finished().await;
        self
    }

    pub fn work_store(&self) -> &Arc<WorkStore> {
        &self.work_store
    }

    pub fn work_unit(&self) -> &Arc<WorkUnitStore> {
        &self.work_unit
    }

    pub fn after_context(&self) -> &AfterContext {
        &self.after
    }

    pub fn wait_until(&self) -> &WaitUntil {
        &self.wait_until
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::after::{AfterState, AfterTask, TaskError, after};
    use crate::context;

    #[tokio::test]
    async fn handler_sees_request_stores() {
        let lifecycle = RequestLifecycle::new("/orders");
        let route = lifecycle
            .respond(async {
                let store = context::current::<WorkStore>().unwrap();
                let unit = context::current::<WorkUnitStore>().unwrap();
                assert_eq!(unit.phase(), Phase::Render);
                assert!(context::current::<AfterContext>().is_some());
                store.route().to_owned()
            })
            .await;
        assert_eq!(route, "/orders");
    }

    #[tokio::test]
    async fn serve_runs_deferred_work_after_delivery() {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handler_events = Arc::clone(&events);
        let deliver_events = Arc::clone(&events);

        let lifecycle = RequestLifecycle::new("/")
            .serve(
                async move {
                    let task_events = Arc::clone(&handler_events);
                    after(AfterTask::deferred_sync(move || {
                        task_events.lock().push("after");
                        Ok::<_, TaskError>(())
                    }))
                    .unwrap();
                    handler_events.lock().push("handler");
                },
                |()| async move { deliver_events.lock().push("delivered") },
            )
            .await;

        assert_eq!(*events.lock(), ["handler", "delivered", "after"]);
        assert_eq!(lifecycle.after_context().state(), AfterState::Idle);
        assert_eq!(lifecycle.work_unit().phase(), Phase::After);
    }
}
