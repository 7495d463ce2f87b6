//! Connection pooling
//!
//! The [`ConnectionPoolManager`] hands out connection holders. Identities that
//! may pool share holders from a fixed set of slots per host; individual SAS
//! identities share one slot array per host, grouped SAS identities one per
//! policy name. The slot is picked from the identity's pool hash, so an
//! identity always lands on the same holder. Everything else (pooling off,
//! X.509 certificates) gets a holder of its own.
//!
//! The manager is an ordinary value: create one and share it by `Arc` between
//! the transports that should pool together.

use crate::connection::{ConnectionAllocator, ConnectionHolder, ConnectionResource};
use crate::link_layer::AmqpConnector;
use crate::metrics::TransportMetrics;
use crate::resource::ResourceAllocator;
use parking_lot::Mutex;
use stateful_amqp_core::{AuthenticationModel, DeviceIdentity};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Slots = Vec<Option<ConnectionHolder>>;

#[derive(Default)]
struct HostPool {
    individual: Slots,
    grouped: HashMap<String, Slots>,
}

/// Registry of shared connection holders
pub struct ConnectionPoolManager {
    allocator: Arc<ConnectionAllocator>,
    pools: Mutex<HashMap<String, HostPool>>,
}

impl ConnectionPoolManager {
    pub fn new(connector: Arc<dyn AmqpConnector>, metrics: Arc<TransportMetrics>) -> Self {
        Self {
            allocator: Arc::new(ConnectionAllocator::new(connector, metrics)),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Connection holder for `identity`
    ///
    /// Pooled slots that hold a disposed holder are refilled with a new one.
    pub fn allocate_holder(&self, identity: &DeviceIdentity) -> ConnectionHolder {
        if !identity.is_pooling() {
            tracing::debug!(device = %identity, "Allocating dedicated connection holder");
            return self.new_holder(format!("connection for {identity}"));
        }

        let size = identity.settings.pool.max_pool_size.max(1) as usize;
        let mut pools = self.pools.lock();
        let pool = pools.entry(identity.host_name.clone()).or_default();

        let (scope, slots) = match identity.authentication {
            AuthenticationModel::SasGrouped => {
                let key_name = identity.shared_access_key_name.clone().unwrap_or_default();
                let slots = pool.grouped.entry(key_name.clone()).or_default();
                (key_name, slots)
            }
            _ => (String::new(), &mut pool.individual),
        };
        if slots.is_empty() {
            slots.resize(size, None);
        }

        let index = (identity.pool_hash() % slots.len() as u64) as usize;
        if let Some(holder) = &slots[index] {
            if !holder.is_disposed() {
                return holder.clone();
            }
            tracing::debug!(host = %identity.host_name, slot = index, "Replacing disposed pooled holder");
        }

        let holder = self.new_holder(format!(
            "pooled connection {}[{}]{}",
            identity.host_name, index, scope
        ));
        let host = identity.host_name.clone();
        holder.subscribe(Arc::new(move || {
            tracing::info!(host = %host, slot = index, "Pooled connection disconnected");
        }));
        slots[index] = Some(holder.clone());
        holder
    }

    /// Number of live pooled holders across every host
    pub fn pooled_holder_count(&self) -> usize {
        let pools = self.pools.lock();
        let live = |slots: &Slots| {
            slots
                .iter()
                .flatten()
                .filter(|holder| !holder.is_disposed())
                .count()
        };
        pools
            .values()
            .map(|pool| live(&pool.individual) + pool.grouped.values().map(live).sum::<usize>())
            .sum()
    }

    fn new_holder(&self, name: String) -> ConnectionHolder {
        let allocator: Arc<dyn ResourceAllocator<ConnectionResource>> = self.allocator.clone();
        ConnectionHolder::new(name, allocator)
    }
}

impl fmt::Debug for ConnectionPoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("hosts", &self.pools.lock().len())
            .finish()
    }
}
