//! Resource capability contracts
//!
//! A resource wraps exactly one link-layer object (connection, session or
//! link). Holders only ever see it through [`Resource`]: a cheap validity
//! check, an immediate abort and an idempotent dispose. Allocators build
//! resources and wire the link layer's closed notification back to the
//! holder that asked for them through a [`ResourceStatusListener`].

use crate::link_layer::Closeable;
use async_trait::async_trait;
use stateful_amqp_core::{DeviceIdentity, ResourceStatus, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A live connection, session or link owned by a holder
pub trait Resource: Send + Sync + 'static {
    /// True until a close or abort of the underlying object is observed
    fn is_valid(&self) -> bool;

    /// Best-effort immediate teardown; idempotent
    fn abort(&self);

    /// Release the resource; idempotent
    fn dispose(&self);

    /// Hook run when the underlying object reports it has closed, before the
    /// holder is notified
    fn on_underlying_closed(&self) {}
}

/// Receives status changes from the resources a holder allocated
pub trait ResourceStatusListener<T>: Send + Sync {
    /// `reporter` is the resource whose underlying object changed state
    fn on_resource_status_change(&self, reporter: &T, status: ResourceStatus);
}

/// Non-owning handle to a status listener
///
/// Resources never keep their holder alive.
pub type StatusListener<T> = Weak<dyn ResourceStatusListener<T>>;

/// Builds new resources on demand
#[async_trait]
pub trait ResourceAllocator<T: Resource>: Send + Sync {
    /// Allocate a live resource for `identity` within `timeout`
    ///
    /// `listener` must be notified with `ResourceStatus::Disconnected` when
    /// the resource's underlying object closes.
    async fn allocate_resource(
        &self,
        identity: &DeviceIdentity,
        listener: StatusListener<T>,
        timeout: Duration,
    ) -> Result<Arc<T>>;
}

/// Route the closed notification of `object` to `listener` as a
/// disconnection of `resource`
///
/// Only weak references are captured: a resource its holder already dropped
/// has nothing left to report.
pub(crate) fn notify_on_close<T: Resource, C: Closeable + ?Sized>(
    object: &C,
    resource: &Arc<T>,
    listener: StatusListener<T>,
) {
    let resource = Arc::downgrade(resource);
    object.on_closed(Box::new(move || {
        let Some(resource) = resource.upgrade() else {
            return;
        };
        resource.on_underlying_closed();
        if let Some(listener) = listener.upgrade() {
            listener.on_resource_status_change(&resource, ResourceStatus::Disconnected);
        }
    }));
}
