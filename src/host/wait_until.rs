//! Tokio-backed lifetime extension.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use tracing::{debug, error};

use super::LifetimeExtender;
use crate::after::report::panic_message;
use crate::background::InFlight;

/// Spawns every extended future and tracks when all of them have settled.
///
/// Cloning yields another handle to the same tracker.
#[derive(Clone, Debug, Default)]
pub struct WaitUntil {
    in_flight: Arc<InFlight>,
    panicked: Arc<AtomicUsize>,
}

impl WaitUntil {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of extended futures that have not settled yet.
    pub fn pending(&self) -> usize {
        self.in_flight.count()
    }

    /// Number of extended futures that panicked.
    pub fn panicked(&self) -> usize {
        self.panicked.load(Ordering::SeqCst)
    }

    /// Resolves once every extended future has settled, including futures
    /// extended while waiting.
    pub async fn wait(&self) {
        self.in_flight.wait_idle().await;
    }
}

impl LifetimeExtender for WaitUntil {
    fn extend_lifetime(&self, work: BoxFuture<'static, ()>) {
        let guard = self.in_flight.enter();
        let panicked = Arc::clone(&self.panicked);
        let task = tokio::spawn(work);

        tokio::spawn(async move {
            let _guard = guard;
            match task.await {
                Ok(()) => debug!("extended work settled"),
                Err(err) if err.is_panic() => {
                    panicked.fetch_add(1, Ordering::SeqCst);
                    error!(
                        panic = %panic_message(err.into_panic().as_ref()),
                        "extended work panicked"
                    );
                }
                Err(err) => debug!(error = %err, "extended work cancelled"),
            }
        });
    }
}
