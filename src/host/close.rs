//! Single-shot "response closed" notification.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::CloseNotifier;

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct CloseState {
    closed: bool,
    callbacks: Vec<Callback>,
}

/// The notifier half: hand this to whoever needs to run code on close.
///
/// Callbacks registered after the response has already closed run
/// immediately on the registering thread.
#[derive(Clone)]
pub struct CloseSignal {
    state: Arc<Mutex<CloseState>>,
}

/// The trigger half, held by the transport that detects the close.
///
/// When the last handle is dropped without [`close`](Self::close) having
/// been called, pending callbacks are dropped without running.
pub struct CloseHandle {
    state: Arc<Mutex<CloseState>>,
}

impl CloseSignal {
    /// Creates a connected notifier/trigger pair.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicBool, Ordering};
    /// use rttp_after::host::{CloseNotifier, CloseSignal};
    ///
    /// let (signal, handle) = CloseSignal::new();
    /// let closed = Arc::new(AtomicBool::new(false));
    /// let flag = Arc::clone(&closed);
    /// signal.on_close(Box::new(move || flag.store(true, Ordering::SeqCst)));
    ///
    /// assert!(!closed.load(Ordering::SeqCst));
    /// handle.close();
    /// assert!(closed.load(Ordering::SeqCst));
    /// ```
    pub fn new() -> (CloseSignal, CloseHandle) {
        let state = Arc::new(Mutex::new(CloseState::default()));
        (
            CloseSignal {
                state: Arc::clone(&state),
            },
            CloseHandle { state },
        )
    }

    /// Returns `true` once the response has closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl CloseNotifier for CloseSignal {
    fn on_close(&self, callback: Callback) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            callback();
        } else {
            state.callbacks.push(callback);
        }
    }
}

impl CloseHandle {
    /// Marks the response closed and runs every registered callback once.
    ///
    /// Closing twice is a host bug; the second call only logs a warning.
    pub fn close(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.closed {
                warn!("response close signalled more than once");
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.callbacks)
        };

        debug!(callbacks = callbacks.len(), "response closed");
        for callback in callbacks {
            callback();
        }
    }
}

impl Drop for CloseHandle {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if !state.closed && !state.callbacks.is_empty() {
            debug!(
                callbacks = state.callbacks.len(),
                "close handle dropped before the response closed"
            );
            state.callbacks.clear();
        }
    }
}
