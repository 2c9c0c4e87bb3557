use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use rttp_after::after::chain::CallerChainRecord;
use rttp_after::after::stitch::BOUNDARY_FRAME;
use rttp_after::after::{TaskError, TaskFailure};
use rttp_after::context::{self, ContextSnapshot};
use rttp_after::{
    AfterState, AfterTask, CommitPending, Phase, RequestLifecycle, WorkStore, WorkUnitStore, after,
};

/// Lifecycle whose error hook records every failure it sees.
fn recording(route: &str) -> (RequestLifecycle, Arc<Mutex<Vec<TaskFailure>>>) {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    let lifecycle = RequestLifecycle::with_options(route, move |options| {
        options.on_task_error(move |failure| {
            let copy = match failure {
                TaskFailure::Panic(msg) => TaskFailure::Panic(msg.clone()),
                TaskFailure::Error(_) => TaskFailure::Error(
                    format!("{failure}\n{}", failure.stack().unwrap_or_default()).into(),
                ),
            };
            sink.lock().push(copy);
        })
    });
    (lifecycle, failures)
}

#[tokio::test]
async fn failing_procedure_is_reported_once_and_others_still_run() {
    let (lifecycle, failures) = recording("/mixed");
    let completed = Arc::new(AtomicUsize::new(0));

    let first = Arc::clone(&completed);
    let third = Arc::clone(&completed);
    lifecycle
        .respond(async move {
            after(AfterTask::deferred_sync(move || {
                first.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TaskError>(())
            }))
            .unwrap();
            after(AfterTask::deferred_sync(|| Err::<(), _>("email service down"))).unwrap();
            after(AfterTask::deferred(move || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                third.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TaskError>(())
            }))
            .unwrap();
        })
        .await;

    lifecycle.close();
    lifecycle.finished().await;

    assert_eq!(completed.load(Ordering::SeqCst), 2);
    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    let report = failures[0].to_string();
    assert!(report.starts_with("email service down"), "{report}");
    assert!(report.contains(BOUNDARY_FRAME), "{report}");
    assert!(report.contains("after_lifecycle.rs"), "{report}");
}

#[tokio::test]
async fn nothing_runs_before_the_response_closes() {
    let (lifecycle, _) = recording("/");
    let ran = Arc::new(AtomicUsize::new(0));

    let flag = Arc::clone(&ran);
    lifecycle
        .respond(async move {
            after(AfterTask::deferred_sync(move || {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TaskError>(())
            }))
            .unwrap();
        })
        .await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(lifecycle.after_context().state(), AfterState::Armed);

    lifecycle.close();
    lifecycle.finished().await;
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn procedures_run_in_the_after_phase() {
    let (lifecycle, _) = recording("/");
    let seen = Arc::new(Mutex::new(None));

    let slot = Arc::clone(&seen);
    lifecycle
        .respond(async move {
            assert_eq!(context::current::<WorkUnitStore>().unwrap().phase(), Phase::Render);
            after(AfterTask::deferred_sync(move || {
                *slot.lock() = context::current::<WorkUnitStore>().map(|unit| unit.phase());
                Ok::<_, TaskError>(())
            }))
            .unwrap();
        })
        .await;

    lifecycle.close();
    lifecycle.finished().await;
    assert_eq!(*seen.lock(), Some(Phase::After));
}

#[tokio::test]
async fn nested_after_is_awaited_and_extends_the_chain() {
    let (lifecycle, _) = recording("/nested");
    let chains = Arc::new(Mutex::new(Vec::new()));

    let outer = Arc::clone(&chains);
    lifecycle
        .respond(async move {
            after(AfterTask::deferred_sync(move || {
                outer
                    .lock()
                    .push(context::current::<CallerChainRecord>().unwrap());
                let inner = Arc::clone(&outer);
                after(AfterTask::deferred(move || async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    inner
                        .lock()
                        .push(context::current::<CallerChainRecord>().unwrap());
                    Ok::<_, TaskError>(())
                }))?;
                Ok::<_, TaskError>(())
            }))
            .unwrap();
        })
        .await;

    lifecycle.close();
    lifecycle.finished().await;

    let chains = chains.lock();
    assert_eq!(chains.len(), 2);
    let (root, nested) = (&chains[0], &chains[1]);
    assert!(root.is_root());
    assert_eq!(root.root_spawn_phase(), Some(Phase::Render));
    assert_eq!(nested.depth(), 1);
    assert_eq!(nested.root_caller_stack(), root.root_caller_stack());
    assert_eq!(nested.root_spawn_phase(), root.root_spawn_phase());
    assert_eq!(lifecycle.after_context().state(), AfterState::Idle);
}

#[derive(Debug)]
struct RequestUser(&'static str);

#[tokio::test]
async fn each_procedure_sees_the_context_it_was_scheduled_in() {
    let (lifecycle, _) = recording("/");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    lifecycle
        .respond(async move {
            for name in ["alice", "bob"] {
                let sink = Arc::clone(&sink);
                ContextSnapshot::capture()
                    .with(Arc::new(RequestUser(name)))
                    .sync_scope(|| {
                        after(AfterTask::deferred_sync(move || {
                            let user = context::current::<RequestUser>().map(|u| u.0);
                            sink.lock().push(user);
                            Ok::<_, TaskError>(())
                        }))
                    })
                    .unwrap();
            }
            assert!(context::current::<RequestUser>().is_none());
        })
        .await;

    lifecycle.close();
    lifecycle.finished().await;

    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, [Some("alice"), Some("bob")]);
}

#[tokio::test]
async fn revalidations_recorded_by_procedures_are_committed() {
    let committed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&committed);
    let lifecycle = RequestLifecycle::with_options("/posts", move |options| {
        options.revalidation(Arc::new(CommitPending::new(move |route, tags| {
            let sink = Arc::clone(&sink);
            async move { sink.lock().push((route, tags)) }.boxed()
        })))
    });

    lifecycle
        .respond(async {
            after(AfterTask::deferred_sync(|| {
                let store = context::current::<WorkStore>().ok_or("no request store")?;
                store.revalidate_tag("posts");
                Ok::<_, TaskError>(())
            }))
            .unwrap();
        })
        .await;

    assert!(committed.lock().is_empty());
    lifecycle.close();
    lifecycle.finished().await;

    assert_eq!(
        *committed.lock(),
        [("/posts".to_owned(), vec!["posts".to_owned()])]
    );
    assert_eq!(lifecycle.work_store().pending_revalidations(), 0);
}

#[tokio::test]
async fn eventual_failures_and_panics_are_reported() {
    let (lifecycle, failures) = recording("/");

    lifecycle
        .respond(async {
            after(AfterTask::eventual(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err::<(), _>("analytics upload failed")
            }))
            .unwrap();
            after(AfterTask::deferred_sync(|| -> Result<(), TaskError> {
                panic!("cache warmup exploded");
            }))
            .unwrap();
        })
        .await;

    lifecycle.close();
    lifecycle.finished().await;

    let failures = failures.lock();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().any(|f| matches!(f, TaskFailure::Panic(msg) if msg == "cache warmup exploded")));
    assert!(
        failures
            .iter()
            .any(|f| f.to_string().starts_with("analytics upload failed"))
    );
}

#[tokio::test]
async fn after_without_lifetime_extender_fails_and_queues_nothing() {
    let (signal, _close) = rttp_after::CloseSignal::new();
    let after_context = rttp_after::AfterContext::new(rttp_after::AfterOptions::new(Arc::new(signal)));

    let err = after_context
        .provide(async { after(AfterTask::deferred_sync(|| Ok::<_, TaskError>(()))) })
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(after_context.pending_tasks(), 0);
}
