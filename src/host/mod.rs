//! Host contracts — what the deferred scheduler needs from the server around it.
//!
//! The scheduler never detects "response closed" on its own, never keeps the
//! process alive by itself and never applies revalidations. Those are the
//! host's job, expressed by the traits below:
//!
//! - [`LifetimeExtender`] — keep the request alive until a future settles.
//! - [`CloseNotifier`] — run a callback once the response is fully closed.
//! - [`RevalidationTracker`] — apply revalidations recorded by some work.
//!
//! Tokio-based implementations are provided for hosts that do not bring
//! their own: [`WaitUntil`], [`CloseSignal`], [`CommitPending`] and
//! [`LogRevalidations`], wired together per request by [`RequestLifecycle`].

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use crate::context::WorkStore;

pub mod close;
pub mod lifecycle;
pub mod wait_until;

pub use close::{CloseHandle, CloseSignal};
pub use lifecycle::RequestLifecycle;
pub use wait_until::WaitUntil;

/// Keeps the host from tearing a request down while work is outstanding.
pub trait LifetimeExtender: Send + Sync {
    /// Registers `work`. The host must drive it to completion, typically by
    /// spawning it, and must not finish the request before it settles.
    fn extend_lifetime(&self, work: BoxFuture<'static, ()>);
}

/// Single-shot notification that the primary response has been closed.
pub trait CloseNotifier: Send + Sync {
    /// Registers `callback` to run exactly once, when the response closes.
    fn on_close(&self, callback: Box<dyn FnOnce() + Send + 'static>);
}

/// Applies revalidations recorded while some work runs.
pub trait RevalidationTracker: Send + Sync {
    /// Runs `work`, then applies every revalidation it recorded on `store`.
    fn track(&self, store: Arc<WorkStore>, work: BoxFuture<'static, ()>) -> BoxFuture<'static, ()>;
}

/// Callback receiving the route and the revalidation tags to commit.
pub type CommitFn = Arc<dyn Fn(String, Vec<String>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Revalidation tracker that hands recorded tags to a commit callback.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use futures::FutureExt;
/// use rttp_after::context::WorkStore;
/// use rttp_after::host::{CommitPending, RevalidationTracker};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let tracker = CommitPending::new(|route, tags| {
///     async move { println!("{route}: revalidating {tags:?}") }.boxed()
/// });
///
/// let store = Arc::new(WorkStore::new("/posts"));
/// let recorder = Arc::clone(&store);
/// tracker
///     .track(Arc::clone(&store), Box::pin(async move { recorder.revalidate_tag("posts") }))
///     .await;
/// assert_eq!(store.pending_revalidations(), 0);
/// # }
/// ```
#[derive(Clone)]
pub struct CommitPending {
    commit: CommitFn,
}

impl CommitPending {
    pub fn new<F>(commit: F) -> Self
    where
        F: Fn(String, Vec<String>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            commit: Arc::new(commit),
        }
    }
}

impl RevalidationTracker for CommitPending {
    fn track(&self, store: Arc<WorkStore>, work: BoxFuture<'static, ()>) -> BoxFuture<'static, ()> {
        let commit = Arc::clone(&self.commit);
        Box::pin(async move {
            work.await;
            let tags = store.take_pending_revalidations();
            if !tags.is_empty() {
                commit(store.route().to_owned(), tags).await;
            }
        })
    }
}

impl fmt::Debug for CommitPending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitPending").finish_non_exhaustive()
    }
}

/// Default revalidation tracker: logs recorded tags and drops them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRevalidations;

impl RevalidationTracker for LogRevalidations {
    fn track(&self, store: Arc<WorkStore>, work: BoxFuture<'static, ()>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            work.await;
            let tags = store.take_pending_revalidations();
            if !tags.is_empty() {
                info!(
                    route = %store.route(),
                    tags = ?tags,
                    "no revalidation backend configured, dropping revalidations"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn commit_pending_commits_after_work() {
        let committed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&committed);
        let tracker = CommitPending::new(move |route, tags| {
            let sink = Arc::clone(&sink);
            async move { sink.lock().push((route, tags)) }.boxed()
        });

        let store = Arc::new(WorkStore::new("/posts"));
        let recorder = Arc::clone(&store);
        tracker
            .track(
                Arc::clone(&store),
                Box::pin(async move {
                    recorder.revalidate_tag("posts");
                    recorder.revalidate_tag("feed");
                }),
            )
            .await;

        let committed = committed.lock();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].0, "/posts");
        assert_eq!(committed[0].1, ["posts", "feed"]);
    }

    #[tokio::test]
    async fn commit_pending_skips_empty_commit() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let tracker = CommitPending::new(move |_, _| {
            *counter.lock() += 1;
            async {}.boxed()
        });

        tracker
            .track(Arc::new(WorkStore::new("/")), Box::pin(async {}))
            .await;
        assert_eq!(*calls.lock(), 0);
    }

    #[tokio::test]
    async fn log_revalidations_drains_store() {
        let store = Arc::new(WorkStore::new("/"));
        store.revalidate_tag("stale");
        LogRevalidations
            .track(Arc::clone(&store), Box::pin(async {}))
            .await;
        assert_eq!(store.pending_revalidations(), 0);
    }
}
