//! Ambient per-request context — type-keyed stores carried across `.await` points.
//!
//! Request-handling code rarely threads every piece of request state through
//! its arguments. Instead, stores such as [`WorkStore`] and [`WorkUnitStore`]
//! are pushed as *ambient* context for the duration of a future and looked up
//! with [`current`] wherever they are needed.
//!
//! ## Core types
//!
//! - [`ContextSnapshot`] — an immutable composite of every store active at a
//!   point in time. Capturing one is cheap (a single `Arc` clone) and running
//!   a future under it restores the exact same view later.
//! - [`current`] / [`provide`] — read or layer a single store.
//!
//! Snapshots live in a Tokio task-local slot, so two futures running under
//! different snapshots on the same runtime never observe each other's stores.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    future::Future,
    sync::Arc,
};

use tokio::task::futures::TaskLocalFuture;

pub mod store;

pub use store::{Phase, WorkStore, WorkUnitId, WorkUnitStore};

tokio::task_local! {
    static SNAPSHOT: ContextSnapshot;
}

type StoreMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// An immutable, type-keyed snapshot of every ambient store.
///
/// Layering a new store with [`with`](Self::with) produces a new snapshot and
/// leaves the original untouched, so a snapshot captured at one point can be
/// replayed later without being affected by anything pushed in between.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rttp_after::context::ContextSnapshot;
///
/// struct TraceId(u64);
///
/// let snapshot = ContextSnapshot::new().with(Arc::new(TraceId(7)));
/// assert_eq!(snapshot.get::<TraceId>().map(|id| id.0), Some(7));
/// assert!(ContextSnapshot::new().get::<TraceId>().is_none());
/// ```
#[derive(Clone, Default)]
pub struct ContextSnapshot {
    stores: Arc<StoreMap>,
}

impl ContextSnapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the snapshot active for the current task, or an empty one
    /// when called outside any scope.
    pub fn capture() -> Self {
        SNAPSHOT.try_with(Clone::clone).unwrap_or_default()
    }

    /// Returns a new snapshot with `value` layered on top.
    ///
    /// A store of the same type already present is shadowed.
    #[must_use]
    pub fn with<T>(&self, value: Arc<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        let mut stores = StoreMap::clone(&self.stores);
        stores.insert(TypeId::of::<T>(), value);
        Self {
            stores: Arc::new(stores),
        }
    }

    /// Returns the store of type `T`, if present.
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.stores
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Returns `true` if a store of type `T` is present.
    pub fn contains<T>(&self) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.stores.contains_key(&TypeId::of::<T>())
    }

    /// Returns the number of stores in the snapshot.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Returns `true` if the snapshot holds no stores.
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Runs `fut` with this snapshot as the ambient context.
    ///
    /// The snapshot is restored on every poll of `fut` and removed in between,
    /// which keeps concurrently running futures isolated from each other.
    pub fn scope<F>(self, fut: F) -> TaskLocalFuture<ContextSnapshot, F>
    where
        F: Future,
    {
        SNAPSHOT.scope(self, fut)
    }

    /// Runs the synchronous closure `f` with this snapshot as the ambient context.
    pub fn sync_scope<F, R>(self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        SNAPSHOT.sync_scope(self, f)
    }
}

impl fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSnapshot")
            .field("stores", &self.stores.len())
            .finish()
    }
}

/// Returns the ambient store of type `T`, if one is in scope.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rttp_after::context::{self, WorkStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// assert!(context::current::<WorkStore>().is_none());
///
/// let route = context::provide(Arc::new(WorkStore::new("/blog")), async {
///     context::current::<WorkStore>().map(|store| store.route().to_owned())
/// })
/// .await;
/// assert_eq!(route.as_deref(), Some("/blog"));
/// # }
/// ```
pub fn current<T>() -> Option<Arc<T>>
where
    T: Send + Sync + 'static,
{
    SNAPSHOT.try_with(|snapshot| snapshot.get::<T>()).ok().flatten()
}

/// Runs `fut` with `value` layered on top of the current ambient snapshot.
pub fn provide<T, F>(value: Arc<T>, fut: F) -> TaskLocalFuture<ContextSnapshot, F>
where
    T: Send + Sync + 'static,
    F: Future,
{
    ContextSnapshot::capture().with(value).scope(fut)
}
