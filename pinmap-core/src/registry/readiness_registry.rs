//! ReadinessRegistry: named component directory with readiness notification
//!
//! Modules that initialize independently register a capability handle under a
//! name; others look it up, wait for it with a timeout, or subscribe to be
//! told when it appears:
//! - FIFO, one-shot delivery per name
//! - Subscriptions are handles that can be cancelled
//! - A timed-out waiter is removed, so nothing is delivered after its caller
//!   has moved on
//! - Dependency lists for introspection and aggregate waits

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use compact_str::CompactString;
use futures::future::join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::error::AppError;
use crate::logging::MARKER_REGISTRY;

/// Opaque capability handle owned by whichever module registered it
pub type ComponentHandle = Arc<dyn Any + Send + Sync>;

pub type ComponentName = CompactString;

type ReadyCallback = Box<dyn FnOnce(ComponentHandle) + Send>;

enum Listener {
    Callback(ReadyCallback),
    Waiter(oneshot::Sender<ComponentHandle>),
}

struct ListenerSlot {
    id: u64,
    listener: Listener,
}

impl ListenerSlot {
    fn deliver(self, handle: &ComponentHandle) {
        match self.listener {
            Listener::Callback(callback) => callback(Arc::clone(handle)),
            Listener::Waiter(tx) => {
                // receiver gone means the waiter already resolved
                let _ = tx.send(Arc::clone(handle));
            }
        }
    }
}

#[derive(Default)]
struct ReadinessEntry {
    instance: Option<ComponentHandle>,
    dependencies: SmallVec<[ComponentName; 4]>,
    ready: bool,
    listeners: VecDeque<ListenerSlot>,
    registrations: u32,
}

/// Handle for a pending readiness listener
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "dropping the handle makes the listener impossible to cancel"]
pub struct Subscription {
    name: ComponentName,
    id: u64,
}

impl Subscription {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Named component directory shared by every module of one session
pub struct ReadinessRegistry {
    entries: Mutex<FxHashMap<ComponentName, ReadinessEntry>>,
    next_listener_id: AtomicU64,
    default_timeout: Duration,
}

impl ReadinessRegistry {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            next_listener_id: AtomicU64::new(1),
            default_timeout,
        }
    }

    /// Timeout for callers that have no timeout of their own
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn next_id(&self) -> u64 {
        self.next_listener_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Store `instance` under `name`, mark it ready and notify its listeners
    /// in the order they subscribed. Re-registering replaces the instance.
    pub fn register<N, I, D>(&self, name: N, instance: ComponentHandle, dependencies: I)
    where
        N: AsRef<str>,
        I: IntoIterator<Item = D>,
        D: Into<ComponentName>,
    {
        let name: ComponentName = name.as_ref().into();
        let dependencies: SmallVec<[ComponentName; 4]> =
            dependencies.into_iter().map(Into::into).collect();

        let (listeners, unmet) = {
            let mut entries = self.entries.lock();

            let unmet: Vec<ComponentName> = dependencies
                .iter()
                .filter(|dep| !entries.get(*dep).is_some_and(|e| e.ready))
                .cloned()
                .collect();

            let entry = entries.entry(name.clone()).or_default();
            if entry.ready {
                warn!(
                    marker = MARKER_REGISTRY,
                    operation_type = "overwrite",
                    component = %name,
                    previous_registrations = entry.registrations,
                    "Component re-registered, replacing previous instance"
                );
            }

            entry.instance = Some(Arc::clone(&instance));
            entry.dependencies = dependencies;
            entry.ready = true;
            entry.registrations += 1;

            (std::mem::take(&mut entry.listeners), unmet)
        };

        if !unmet.is_empty() {
            debug!(
                marker = MARKER_REGISTRY,
                operation_type = "unmet_dependencies",
                component = %name,
                unmet = ?unmet,
                "Registered before its dependencies"
            );
        }

        info!(
            marker = MARKER_REGISTRY,
            operation_type = "register",
            component = %name,
            listeners = listeners.len(),
            "Component ready"
        );

        // Delivered outside the lock so listeners may use the registry
        for slot in listeners {
            slot.deliver(&instance);
        }
    }

    /// Wrap `value` in a handle and register it
    pub fn register_instance<N, T, I, D>(&self, name: N, value: T, dependencies: I)
    where
        N: AsRef<str>,
        T: Send + Sync + 'static,
        I: IntoIterator<Item = D>,
        D: Into<ComponentName>,
    {
        self.register(name, Arc::new(value), dependencies);
    }

    /// Instance registered under `name`, without waiting
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ComponentHandle> {
        self.entries
            .lock()
            .get(name)
            .filter(|e| e.ready)
            .and_then(|e| e.instance.clone())
    }

    /// Instance under `name` downcast to `T` and cloned
    #[must_use]
    pub fn get_typed<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Option<T> {
        let handle = self.get(name)?;
        let typed = handle.downcast_ref::<T>().cloned();
        if typed.is_none() {
            warn!(
                marker = MARKER_REGISTRY,
                operation_type = "type_mismatch",
                component = name,
                expected = std::any::type_name::<T>(),
                "Component has a different type than requested"
            );
        }
        typed
    }

    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.entries.lock().get(name).is_some_and(|e| e.ready)
    }

    /// Resolve with the instance once `name` is ready, or `None` after
    /// `timeout`. Returns without suspending if it is already ready.
    pub async fn wait_for(&self, name: &str, timeout: Duration) -> Option<ComponentHandle> {
        let (id, rx) = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(name.into()).or_default();

            if entry.ready
                && let Some(instance) = &entry.instance
            {
                return Some(Arc::clone(instance));
            }

            let (tx, rx) = oneshot::channel();
            let id = self.next_id();
            entry.listeners.push_back(ListenerSlot {
                id,
                listener: Listener::Waiter(tx),
            });
            (id, rx)
        };

        trace!(
            marker = MARKER_REGISTRY,
            operation_type = "wait_start",
            component = name,
            timeout_ms = timeout.as_millis(),
            "Waiting for component"
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(instance)) => Some(instance),
            Ok(Err(_)) => None,
            Err(_) => {
                self.remove_listener(name, id);
                debug!(
                    marker = MARKER_REGISTRY,
                    operation_type = "wait_timeout",
                    component = name,
                    timeout_ms = timeout.as_millis(),
                    "Component did not become ready in time"
                );
                None
            }
        }
    }

    /// Wait on every name concurrently. `true` only if all became ready
    /// within `timeout`; one timeout does not cut the other waits short.
    pub async fn wait_for_dependencies<S: AsRef<str>>(&self, names: &[S], timeout: Duration) -> bool {
        self.wait_for_all(names, timeout).await.is_ok()
    }

    /// Like [`Self::wait_for_dependencies`], returning the handles in input
    /// order, or the names that timed out.
    pub async fn wait_for_all<S: AsRef<str>>(
        &self,
        names: &[S],
        timeout: Duration,
    ) -> Result<Vec<ComponentHandle>, AppError> {
        let results = join_all(names.iter().map(|n| self.wait_for(n.as_ref(), timeout))).await;

        let missing: Vec<ComponentName> = names
            .iter()
            .zip(&results)
            .filter(|(_, r)| r.is_none())
            .map(|(n, _)| n.as_ref().into())
            .collect();

        if missing.is_empty() {
            Ok(results.into_iter().flatten().collect())
        } else {
            Err(AppError::DependencyTimeout {
                names: missing,
                timeout,
            })
        }
    }

    /// Call `callback` when `name` becomes ready; synchronously right away
    /// if it already is.
    pub fn on_component_ready<F>(&self, name: &str, callback: F) -> Subscription
    where
        F: FnOnce(ComponentHandle) + Send + 'static,
    {
        let id = self.next_id();
        let ready_instance = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(name.into()).or_default();
            let instance = entry.instance.clone().filter(|_| entry.ready);

            if instance.is_none() {
                entry.listeners.push_back(ListenerSlot {
                    id,
                    listener: Listener::Callback(Box::new(callback)),
                });
                return Subscription {
                    name: name.into(),
                    id,
                };
            }
            instance
        };

        if let Some(instance) = ready_instance {
            callback(instance);
        }

        Subscription {
            name: name.into(),
            id,
        }
    }

    /// Cancel a pending listener. Returns `false` if it already fired.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.remove_listener(&subscription.name, subscription.id)
    }

    fn remove_listener(&self, name: &str, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(name) else {
            return false;
        };

        let before = entry.listeners.len();
        entry.listeners.retain(|slot| slot.id != id);
        before != entry.listeners.len()
    }

    /// Declared dependencies of a registered component
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Option<Vec<ComponentName>> {
        self.entries
            .lock()
            .get(name)
            .filter(|e| e.ready)
            .map(|e| e.dependencies.to_vec())
    }

    /// Declared dependencies of `name` that are not ready yet
    #[must_use]
    pub fn unmet_dependencies(&self, name: &str) -> Vec<ComponentName> {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(name) else {
            return Vec::new();
        };

        entry
            .dependencies
            .iter()
            .filter(|dep| !entries.get(*dep).is_some_and(|e| e.ready))
            .cloned()
            .collect()
    }

    /// Names of all ready components, sorted
    #[must_use]
    pub fn loaded_components(&self) -> Vec<ComponentName> {
        let mut names: Vec<ComponentName> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.ready)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Listeners still waiting on `name`
    #[must_use]
    pub fn pending_listeners(&self, name: &str) -> usize {
        self.entries.lock().get(name).map_or(0, |e| e.listeners.len())
    }
}

impl Default for ReadinessRegistry {
    fn default() -> Self {
        Self::new(Duration::from_millis(5000))
    }
}

impl fmt::Debug for ReadinessRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessRegistry")
            .field("loaded", &self.loaded_components())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
