//! Generic resource holder
//!
//! A [`ResourceHolder`] caches at most one live resource and tracks what the
//! caller wants from it through an [`OperationStatus`]. It is the unit of
//! reuse for connections, sessions and links alike; the kind of resource is
//! decided only by the injected [`ResourceAllocator`].
//!
//! # Synchronization
//!
//! Each holder has two independent synchronization domains:
//!
//! - a short status mutex guarding the status, the cached resource and the
//!   disconnection subscribers; never held across an `.await`
//! - an allocation gate (a single-permit semaphore) serializing the
//!   "validate or allocate" critical section, which may block on network I/O
//!
//! Status reads and writes therefore never wait behind an allocation in
//! flight, and concurrent `ensure_resource` callers collapse onto a single
//! allocation.
//!
//! # State Transitions
//!
//! ```text
//! Inactive ──open──▶ Active ──close/abort──▶ Inactive
//!     │                 │
//!     └────dispose──────┴──────▶ Disposed
//! ```
//!
//! After every allocation the holder re-reads its status before handing the
//! resource out: a resource built while the holder was closed is aborted, one
//! built while it was disposed is disposed.

use crate::resource::{Resource, ResourceAllocator, ResourceStatusListener};
use parking_lot::Mutex;
use stateful_amqp_core::{DeviceIdentity, Error, OperationStatus, ResourceStatus, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Callback fired when the holder's resource disconnects unexpectedly
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Token returned by [`ResourceHolder::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

struct HolderState<T> {
    status: OperationStatus,
    resource: Option<Arc<T>>,
    subscribers: Vec<(Subscription, DisconnectCallback)>,
}

struct HolderInner<T: Resource> {
    name: String,
    allocator: Arc<dyn ResourceAllocator<T>>,
    state: Mutex<HolderState<T>>,
    gate: Semaphore,
    next_subscription: AtomicU64,
}

/// Cache plus lifecycle state machine around one allocator
///
/// Cloning is cheap and yields a handle to the same holder.
pub struct ResourceHolder<T: Resource> {
    inner: Arc<HolderInner<T>>,
}

impl<T: Resource> Clone for ResourceHolder<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Resource> fmt::Debug for ResourceHolder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHolder")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

impl<T: Resource> ResourceHolder<T> {
    /// Create an inactive holder around `allocator`
    pub fn new(name: impl Into<String>, allocator: Arc<dyn ResourceAllocator<T>>) -> Self {
        Self {
            inner: Arc::new(HolderInner {
                name: name.into(),
                allocator,
                state: Mutex::new(HolderState {
                    status: OperationStatus::Inactive,
                    resource: None,
                    subscribers: Vec::new(),
                }),
                gate: Semaphore::new(1),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Name used in logs and errors
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// What the caller last asked of this holder
    pub fn status(&self) -> OperationStatus {
        self.inner.state.lock().status
    }

    /// Whether `dispose` has run; disposed holders never come back
    pub fn is_disposed(&self) -> bool {
        self.status() == OperationStatus::Disposed
    }

    /// Whether two handles refer to the same holder
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The cached resource, if there is one and it is still valid
    pub fn current(&self) -> Option<Arc<T>> {
        self.inner
            .state
            .lock()
            .resource
            .clone()
            .filter(|resource| resource.is_valid())
    }

    /// Mark the holder active and make sure it has a live resource
    pub async fn open(&self, identity: &DeviceIdentity, timeout: Duration) -> Result<Arc<T>> {
        {
            let mut state = self.inner.state.lock();
            if state.status == OperationStatus::Disposed {
                return Err(self.disposed());
            }
            state.status = OperationStatus::Active;
        }
        tracing::debug!(holder = %self.inner.name, "Holder opened");
        self.ensure_resource(identity, timeout).await
    }

    /// Mark the holder inactive and abort its resource
    ///
    /// Fails with `Error::Timeout` when the allocation gate cannot be
    /// acquired within `timeout`; the status is already inactive by then.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.status == OperationStatus::Disposed {
                return Err(self.disposed());
            }
            state.status = OperationStatus::Inactive;
        }

        let _permit = self.acquire_gate(timeout).await?;
        let resource = self.inner.state.lock().resource.take();
        if let Some(resource) = resource {
            if resource.is_valid() {
                resource.abort();
            }
        }
        tracing::debug!(holder = %self.inner.name, "Holder closed");
        Ok(())
    }

    /// Return the cached resource if valid, otherwise allocate a new one
    ///
    /// Fails immediately when the holder is inactive or disposed. Gate
    /// acquisition is bounded by `timeout` and surfaces as a transient
    /// `Error::Timeout`.
    pub async fn ensure_resource(
        &self,
        identity: &DeviceIdentity,
        timeout: Duration,
    ) -> Result<Arc<T>> {
        self.check_active()?;

        let resource = {
            let _permit = self.acquire_gate(timeout).await?;
            let cached = self.inner.state.lock().resource.clone();
            match cached {
                Some(resource) if resource.is_valid() => resource,
                _ => {
                    // Status may have changed while waiting for the gate
                    self.check_active()?;
                    let listener = Arc::downgrade(&self.inner) as Weak<dyn ResourceStatusListener<T>>;
                    tracing::debug!(holder = %self.inner.name, "Allocating resource");
                    let fresh = self
                        .inner
                        .allocator
                        .allocate_resource(identity, listener, timeout)
                        .await?;
                    if !self.cache_if_valid(&fresh) {
                        return Err(self.closed_during_allocation(&fresh));
                    }
                    fresh
                }
            }
        };

        let status = self.reconcile(&resource);
        match status {
            OperationStatus::Active => Ok(resource),
            OperationStatus::Inactive => {
                tracing::debug!(holder = %self.inner.name, "Holder closed during allocation");
                resource.abort();
                Err(self.inactive())
            }
            OperationStatus::Disposed => {
                tracing::debug!(holder = %self.inner.name, "Holder disposed during allocation");
                resource.dispose();
                Err(self.disposed())
            }
        }
    }

    /// Mark the holder inactive and abort its resource without waiting
    ///
    /// A disposed holder stays disposed.
    pub fn abort(&self) {
        let resource = {
            let mut state = self.inner.state.lock();
            if state.status == OperationStatus::Disposed {
                tracing::debug!(holder = %self.inner.name, "Abort ignored on disposed holder");
                return;
            }
            state.status = OperationStatus::Inactive;
            state.resource.take()
        };
        if let Some(resource) = resource {
            if resource.is_valid() {
                resource.abort();
            }
        }
    }

    /// Permanently dispose the holder and its resource; idempotent
    ///
    /// Callers waiting on the allocation gate fail with `Error::Disposed`.
    pub fn dispose(&self) {
        let resource = {
            let mut state = self.inner.state.lock();
            if state.status == OperationStatus::Disposed {
                return;
            }
            state.status = OperationStatus::Disposed;
            state.subscribers.clear();
            state.resource.take()
        };
        self.inner.gate.close();
        if let Some(resource) = resource {
            resource.dispose();
        }
        tracing::debug!(holder = %self.inner.name, "Holder disposed");
    }

    /// Register a callback for unexpected disconnections
    pub fn subscribe(&self, callback: DisconnectCallback) -> Subscription {
        let token = Subscription(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.state.lock().subscribers.push((token, callback));
        token
    }

    /// Remove a callback; returns false if it was not registered
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|(token, _)| *token != subscription);
        state.subscribers.len() != before
    }

    fn check_active(&self) -> Result<()> {
        match self.status() {
            OperationStatus::Active => Ok(()),
            OperationStatus::Inactive => Err(self.inactive()),
            OperationStatus::Disposed => Err(self.disposed()),
        }
    }

    /// Cache `resource` unless it has already closed
    ///
    /// Validity is checked under the status mutex, so a closed notification
    /// either finds the resource cached or is seen here.
    fn cache_if_valid(&self, resource: &Arc<T>) -> bool {
        let mut state = self.inner.state.lock();
        if !resource.is_valid() {
            return false;
        }
        state.resource = Some(Arc::clone(resource));
        true
    }

    /// Drop a resource that closed before it was cached and deliver the
    /// disconnection its closed notification could not
    fn closed_during_allocation(&self, resource: &Arc<T>) -> Error {
        resource.abort();
        let callbacks: Vec<DisconnectCallback> = {
            let state = self.inner.state.lock();
            if state.status == OperationStatus::Active {
                state.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
            } else {
                Vec::new()
            }
        };
        tracing::info!(holder = %self.inner.name, "Resource closed before it was cached");
        for callback in callbacks {
            callback();
        }
        Error::TransientCommunication(format!("{} closed during allocation", self.inner.name))
    }

    /// Read the status after an allocation and forget `resource` if it may
    /// not be handed out
    fn reconcile(&self, resource: &Arc<T>) -> OperationStatus {
        let mut state = self.inner.state.lock();
        if state.status != OperationStatus::Active {
            let cached = state
                .resource
                .as_ref()
                .map_or(false, |cached| Arc::ptr_eq(cached, resource));
            if cached {
                state.resource = None;
            }
        }
        state.status
    }

    async fn acquire_gate(&self, timeout: Duration) -> Result<SemaphorePermit<'_>> {
        match tokio::time::timeout(timeout, self.inner.gate.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(self.disposed()),
            Err(_) => Err(Error::Timeout(format!(
                "{} busy for longer than {:?}",
                self.inner.name, timeout
            ))),
        }
    }

    fn disposed(&self) -> Error {
        Error::Disposed(self.inner.name.clone())
    }

    fn inactive(&self) -> Error {
        Error::Inactive(self.inner.name.clone())
    }
}

impl<T: Resource> ResourceStatusListener<T> for HolderInner<T> {
    fn on_resource_status_change(&self, reporter: &T, status: ResourceStatus) {
        if status != ResourceStatus::Disconnected {
            return;
        }

        let callbacks: Vec<DisconnectCallback> = {
            let mut state = self.state.lock();
            if state.status != OperationStatus::Active {
                return;
            }
            // A stale resource must not evict its replacement
            let is_current = state
                .resource
                .as_ref()
                .map_or(false, |cached| std::ptr::eq(Arc::as_ptr(cached), reporter));
            if !is_current {
                return;
            }
            state.resource = None;
            state.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        tracing::info!(holder = %self.name, "Resource disconnected unexpectedly");
        for callback in callbacks {
            callback();
        }
    }
}
