//! Reporting failures of deferred work.
//!
//! By the time a scheduled task fails, the request that scheduled it has
//! already been answered, so failures are observability events rather than
//! control flow: they are logged, optionally handed to a user hook, and never
//! returned to anyone.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use tracing::error;

use super::chain::CallerChainRecord;
use super::stitch::{self, StitchError};

/// Error type produced by scheduled tasks.
pub type TaskError = Box<dyn Error + Send + Sync + 'static>;

/// User hook invoked with every reported failure.
pub type TaskErrorHook = Arc<dyn Fn(&TaskFailure) + Send + Sync + 'static>;

/// Which kind of scheduled task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// An already-running future handed to the scheduler.
    Eventual,
    /// A deferred procedure run after the response closed.
    Function,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eventual => "eventual",
            Self::Function => "function",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a scheduled task failed.
#[derive(Debug)]
pub enum TaskFailure {
    /// The task returned an error.
    Error(TaskError),
    /// The task panicked; holds the panic message.
    Panic(String),
}

impl TaskFailure {
    /// Builds a failure from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panic(panic_message(payload.as_ref()))
    }

    /// Returns the error, if the task failed with one.
    pub fn error(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            Self::Error(err) => Some(err.as_ref()),
            Self::Panic(_) => None,
        }
    }

    /// Returns the stitched stack when the error carries one.
    pub fn stack(&self) -> Option<&str> {
        self.error()
            .and_then(|err| err.downcast_ref::<stitch::StitchedError>())
            .map(stitch::StitchedError::stack)
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => write!(f, "{err}"),
            Self::Panic(message) => write!(f, "panicked: {message}"),
        }
    }
}

/// Extracts a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Funnels every task failure through logging and the optional user hook.
///
/// Cheap to clone; every clone shares the same hook.
#[derive(Clone)]
pub struct ErrorReporter {
    hook: Option<TaskErrorHook>,
    stitch_errors: bool,
    max_stitch_depth: usize,
}

impl ErrorReporter {
    pub fn new(hook: Option<TaskErrorHook>, stitch_errors: bool, max_stitch_depth: usize) -> Self {
        Self {
            hook,
            stitch_errors,
            max_stitch_depth,
        }
    }

    /// Reports one failure of a task of `kind`.
    ///
    /// Never fails and never panics on behalf of the stitcher or the hook:
    /// both are isolated and their own failures are logged separately.
    pub fn report(&self, kind: TaskKind, failure: TaskFailure, chain: Option<&CallerChainRecord>) {
        let failure = self.decorate(failure, chain);
        let stack = failure.stack().unwrap_or_default();
        let chain_json = chain
            .and_then(|record| serde_json::to_string(record).ok())
            .unwrap_or_default();

        match kind {
            TaskKind::Eventual => error!(
                kind = %kind,
                error = %failure,
                stack = %stack,
                chain = %chain_json,
                "a future passed to after() failed"
            ),
            TaskKind::Function => error!(
                kind = %kind,
                error = %failure,
                stack = %stack,
                chain = %chain_json,
                "an error occurred in a function passed to after()"
            ),
        }

        if let Some(hook) = &self.hook {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(&failure))) {
                error!(
                    kind = %kind,
                    panic = %panic_message(payload.as_ref()),
                    "after() task error hook panicked"
                );
            }
        }
    }

    fn decorate(&self, failure: TaskFailure, chain: Option<&CallerChainRecord>) -> TaskFailure {
        match (failure, chain) {
            (TaskFailure::Error(err), Some(chain)) if self.stitch_errors => {
                match stitch::stitch(err, chain, self.max_stitch_depth) {
                    Ok(stitched) => TaskFailure::Error(Box::new(stitched)),
                    Err((stitch_err, original)) => {
                        log_stitch_failure(&stitch_err);
                        TaskFailure::Error(original)
                    }
                }
            }
            (failure, _) => failure,
        }
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("hook", &self.hook.is_some())
            .field("stitch_errors", &self.stitch_errors)
            .field("max_stitch_depth", &self.max_stitch_depth)
            .finish()
    }
}

fn log_stitch_failure(err: &StitchError) {
    error!(error = %err, "failed to stitch after() caller stack onto task error");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::after::chain::{CallerInfo, CallerStack};
    use crate::context::Phase;

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_logs(f: impl FnOnce()) -> String {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buffer.0.lock().clone();
        String::from_utf8(bytes).unwrap()
    }

    fn chain(root: &str) -> CallerChainRecord {
        CallerChainRecord::root(CallerInfo::new(CallerStack::new([root])), Some(Phase::Render))
    }

    fn recording_hook() -> (TaskErrorHook, Arc<Mutex<Vec<(String, Option<String>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook: TaskErrorHook = Arc::new(move |failure: &TaskFailure| {
            sink.lock()
                .push((failure.to_string(), failure.stack().map(str::to_owned)));
        });
        (hook, seen)
    }

    #[test]
    fn function_failure_is_stitched_and_logged() {
        let (hook, seen) = recording_hook();
        let reporter = ErrorReporter::new(Some(hook), true, 8);

        let logs = capture_logs(|| {
            reporter.report(
                TaskKind::Function,
                TaskFailure::Error("cache write failed".into()),
                Some(&chain("at src/routes/posts.rs:10:5")),
            );
        });

        assert!(logs.contains("an error occurred in a function passed to after()"));
        assert!(logs.contains("kind=function"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "cache write failed");
        let stack = seen[0].1.as_deref().unwrap();
        assert!(stack.contains(stitch::BOUNDARY_FRAME));
        assert!(stack.contains("at src/routes/posts.rs:10:5"));
    }

    #[test]
    fn eventual_failure_uses_its_own_message() {
        let reporter = ErrorReporter::new(None, true, 8);
        let logs = capture_logs(|| {
            reporter.report(TaskKind::Eventual, TaskFailure::Error("rejected".into()), None);
        });
        assert!(logs.contains("a future passed to after() failed"));
        assert!(!logs.contains("function passed to after()"));
    }

    #[test]
    fn stitch_failure_still_reports_original() {
        let (hook, seen) = recording_hook();
        let reporter = ErrorReporter::new(Some(hook), true, 8);
        let empty_root = CallerChainRecord::root(CallerInfo::default(), None);

        let logs = capture_logs(|| {
            reporter.report(
                TaskKind::Function,
                TaskFailure::Error("boom".into()),
                Some(&empty_root),
            );
        });

        assert!(logs.contains("failed to stitch after() caller stack onto task error"));
        assert!(logs.contains("an error occurred in a function passed to after()"));
        let seen = seen.lock();
        assert_eq!(seen.as_slice(), [("boom".to_string(), None)]);
    }

    #[test]
    fn panicking_hook_is_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let hook: TaskErrorHook = Arc::new(move |_: &TaskFailure| {
            counter.fetch_add(1, Ordering::SeqCst);
            panic!("hook is broken");
        });
        let reporter = ErrorReporter::new(Some(hook), true, 8);

        let logs = capture_logs(|| {
            reporter.report(
                TaskKind::Function,
                TaskFailure::Error("boom".into()),
                Some(&chain("at root")),
            );
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(logs.contains("after() task error hook panicked"));
        assert!(logs.contains("hook is broken"));
        assert_eq!(logs.matches("an error occurred in a function passed to after()").count(), 1);
    }

    #[test]
    fn panics_are_reported_unstitched() {
        let (hook, seen) = recording_hook();
        let reporter = ErrorReporter::new(Some(hook), true, 8);
        let failure = TaskFailure::from_panic(Box::new("index out of bounds"));

        capture_logs(|| reporter.report(TaskKind::Function, failure, Some(&chain("at root"))));

        let seen = seen.lock();
        assert_eq!(seen[0], ("panicked: index out of bounds".to_string(), None));
    }

    #[test]
    fn stitching_can_be_disabled() {
        let (hook, seen) = recording_hook();
        let reporter = ErrorReporter::new(Some(hook), false, 8);
        capture_logs(|| {
            reporter.report(
                TaskKind::Function,
                TaskFailure::Error("boom".into()),
                Some(&chain("at root")),
            );
        });
        assert_eq!(seen.lock()[0].1, None);
    }
}
