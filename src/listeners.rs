//! C8 — the three independent listener registries: status updates,
//! daemon-version warnings, and disconnection events.
//!
//! Each registry is an `ArcSwap`-guarded, immutable-set-replacement
//! `Vec` — adding or removing a listener swaps in a whole new `Vec`
//! rather than mutating one in place, the same discipline §5 and §9
//! ask for on `ClientState` itself. A listener is identified by the
//! `Arc` it was registered under, so `remove` is `Arc::ptr_eq` and
//! both operations are idempotent.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::state::ClientStateView;

type StatusFn = dyn Fn(&ClientStateView) + Send + Sync;
type VersionFn = dyn Fn(&str) + Send + Sync;
type DisconnectionFn = dyn Fn(bool) + Send + Sync;

/// A single set-valued, CAS-updated listener registry.
struct Registry<F: ?Sized> {
    listeners: ArcSwap<Vec<Arc<F>>>,
}

impl<F: ?Sized> Registry<F> {
    fn new() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Idempotent: adding the same `Arc` twice is a no-op.
    fn add(&self, listener: Arc<F>) {
        self.listeners.rcu(|current| {
            if current.iter().any(|l| Arc::ptr_eq(l, &listener)) {
                current.clone()
            } else {
                let mut next = (**current).clone();
                next.push(listener.clone());
                Arc::new(next)
            }
        });
    }

    /// Idempotent: removing a listener not present is a no-op.
    fn remove(&self, listener: &Arc<F>) {
        self.listeners.rcu(|current| {
            let mut next = (**current).clone();
            next.retain(|l| !Arc::ptr_eq(l, listener));
            Arc::new(next)
        });
    }

    fn snapshot(&self) -> Arc<Vec<Arc<F>>> {
        self.listeners.load_full()
    }
}

/// Owns the three registries and dispatches to them. A faulty
/// listener panicking never prevents the others from being called —
/// each invocation is wrapped in `catch_unwind` and any panic is
/// logged and swallowed, mirroring the spec's "listener exceptions
/// are caught and logged" rule without Rust having checked
/// exceptions to catch.
pub struct Listeners {
    status: Registry<StatusFn>,
    version: Registry<VersionFn>,
    disconnection: Registry<DisconnectionFn>,
}

impl Listeners {
    pub fn new() -> Self {
        Self {
            status: Registry::new(),
            version: Registry::new(),
            disconnection: Registry::new(),
        }
    }

    pub fn add_status_listener(&self, listener: Arc<StatusFn>) {
        self.status.add(listener);
    }
    pub fn remove_status_listener(&self, listener: &Arc<StatusFn>) {
        self.status.remove(listener);
    }
    pub fn notify_status(&self, view: &ClientStateView) {
        for listener in self.status.snapshot().iter() {
            invoke(|| listener(view));
        }
    }

    pub fn add_version_listener(&self, listener: Arc<VersionFn>) {
        self.version.add(listener);
    }
    pub fn remove_version_listener(&self, listener: &Arc<VersionFn>) {
        self.version.remove(listener);
    }
    pub fn notify_version(&self, message: &str) {
        // Dereference the registry snapshot before iterating (spec
        // §9 open question: the source invokes the atom-wrapped set
        // itself here, a latent bug we deliberately do not replicate).
        let snapshot = self.version.snapshot();
        for listener in snapshot.iter() {
            invoke(|| listener(message));
        }
    }

    pub fn add_disconnection_listener(&self, listener: Arc<DisconnectionFn>) {
        self.disconnection.add(listener);
    }
    pub fn remove_disconnection_listener(&self, listener: &Arc<DisconnectionFn>) {
        self.disconnection.remove(listener);
    }
    pub fn notify_disconnection(&self, unexpected: bool) {
        for listener in self.disconnection.snapshot().iter() {
            invoke(|| listener(unexpected));
        }
    }
}

impl Default for Listeners {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("listener panicked; continuing with remaining listeners");
    }
}
