//! # rttp-after
//!
//! Post-response deferred tasks for async request handlers.
//!
//! A handler calls [`after`] to register work that must only run once its
//! response has been fully sent. The work keeps the request alive through
//! the host's lifetime extender, runs with the request's ambient context,
//! and reports failures (stitched with the call sites that scheduled them)
//! to a configurable hook instead of the long-gone caller.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rttp_after::{after, AfterTask, RequestLifecycle};
//!
//! #[tokio::main]
//! async fn main() {
//!     tracing_subscriber::fmt::init();
//!
//!     let lifecycle = RequestLifecycle::with_options("/signup", |options| {
//!         options.on_task_error(|failure| eprintln!("after() failed: {failure}"))
//!     });
//!
//!     lifecycle
//!         .serve(
//!             async {
//!                 after(AfterTask::deferred(|| async {
//!                     // e.g. send the welcome email
//!                     Ok::<_, std::io::Error>(())
//!                 }))
//!                 .expect("inside a request");
//!                 "Welcome!"
//!             },
//!             |body| async move { println!("{body}") },
//!         )
//!         .await;
//! }
//! ```

// ── Scheduler ─────────────────────────────────────────────────────────────────
pub mod after;
pub mod background;

// ── Ambient request context and host integration ─────────────────────────────
pub mod context;
pub mod host;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use after::{
    AfterConfig, AfterContext, AfterError, AfterOptions, AfterState, AfterTask, TaskFailure,
    TaskKind, after,
};
pub use context::{ContextSnapshot, Phase, WorkStore, WorkUnitStore};
pub use host::{CloseSignal, CommitPending, RequestLifecycle, WaitUntil};
