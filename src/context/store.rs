//! The two request-scoped stores the deferred scheduler cares about.
//!
//! - [`WorkStore`] — one per incoming request. Must be in scope whenever
//!   deferred work actually runs.
//! - [`WorkUnitStore`] — one per unit of work inside a request (a render, a
//!   server action). Carries the mutable [`Phase`] that application code reads
//!   to find out whether it is running after the response.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Execution phase of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Handling a mutation before the response is produced.
    Action,
    /// Producing the response.
    Render,
    /// Running deferred work after the response has been closed.
    After,
}

impl Phase {
    /// Returns the phase label as a string slice.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Render => "render",
            Self::After => "after",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a [`WorkUnitStore`], unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkUnitId(u64);

impl WorkUnitId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        WorkUnitId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Sub-request context: a single unit of work within a request.
#[derive(Debug)]
pub struct WorkUnitStore {
    id: WorkUnitId,
    route: String,
    phase: RwLock<Phase>,
}

impl WorkUnitStore {
    /// Creates a work unit for `route`, starting in `phase`.
    pub fn new(route: impl Into<String>, phase: Phase) -> Self {
        Self {
            id: WorkUnitId::next(),
            route: route.into(),
            phase: RwLock::new(phase),
        }
    }

    /// Returns the process-unique id of this work unit.
    pub fn id(&self) -> WorkUnitId {
        self.id
    }

    /// Returns the route this work unit renders.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Returns the current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    /// Moves the work unit into `phase`.
    pub fn set_phase(&self, phase: Phase) {
        *self.phase.write() = phase;
    }
}

/// Request context: state shared by every work unit of one request.
///
/// Revalidations requested while handling the request are recorded here and
/// applied by a [`RevalidationTracker`](crate::host::RevalidationTracker) once
/// the surrounding work finishes.
#[derive(Debug)]
pub struct WorkStore {
    route: String,
    pending_revalidations: Mutex<Vec<String>>,
}

impl WorkStore {
    /// Creates the request context for `route`.
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            pending_revalidations: Mutex::new(Vec::new()),
        }
    }

    /// Returns the route of the request.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Records that cached data tagged `tag` must be revalidated.
    ///
    /// Duplicate tags are recorded once.
    pub fn revalidate_tag(&self, tag: impl Into<String>) {
        let tag = tag.into();
        let mut pending = self.pending_revalidations.lock();
        if !pending.contains(&tag) {
            pending.push(tag);
        }
    }

    /// Returns the number of revalidations waiting to be applied.
    pub fn pending_revalidations(&self) -> usize {
        self.pending_revalidations.lock().len()
    }

    /// Removes and returns every pending revalidation, in request order.
    pub fn take_pending_revalidations(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending_revalidations.lock())
    }
}
