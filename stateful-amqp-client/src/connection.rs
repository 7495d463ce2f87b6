//! AMQP connection resource and its allocator
//!
//! The connection allocator opens a network connection through an
//! [`AmqpConnector`], creates the CBS link on it and, for grouped SAS
//! credentials, starts a token refresher scoped to the hub. Sessions are
//! allocated from a live [`ConnectionResource`]; for individual SAS
//! credentials each session brings its own refresher scoped to the device.

use crate::holder::ResourceHolder;
use crate::link_layer::{AmqpConnection, AmqpConnector, CbsLink};
use crate::metrics::TransportMetrics;
use crate::refresher::AuthenticationRefresher;
use crate::resource::{notify_on_close, Resource, ResourceAllocator, StatusListener};
use crate::session::SessionResource;
use async_trait::async_trait;
use parking_lot::Mutex;
use stateful_amqp_core::{AuthenticationModel, DeviceIdentity, Error, Layer, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Holder caching one AMQP connection
pub type ConnectionHolder = ResourceHolder<ConnectionResource>;

/// A live AMQP connection plus its CBS link
pub struct ConnectionResource {
    host_name: String,
    connection: Arc<dyn AmqpConnection>,
    cbs: Arc<dyn CbsLink>,
    refresher: Mutex<Option<AuthenticationRefresher>>,
    metrics: Arc<TransportMetrics>,
}

impl ConnectionResource {
    fn new(
        host_name: String,
        connection: Arc<dyn AmqpConnection>,
        cbs: Arc<dyn CbsLink>,
        refresher: Option<AuthenticationRefresher>,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        Self {
            host_name,
            connection,
            cbs,
            refresher: Mutex::new(refresher),
            metrics,
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Open a session on this connection
    ///
    /// Individual SAS identities get a device-scoped token refresher that
    /// lives as long as the session.
    pub async fn allocate_session(
        &self,
        identity: &DeviceIdentity,
        listener: StatusListener<SessionResource>,
        timeout: Duration,
    ) -> Result<Arc<SessionResource>> {
        if !self.is_valid() {
            return Err(Error::Disconnected(Layer::Connection));
        }

        let session = self
            .connection
            .open_session(timeout)
            .await
            .map_err(|e| e.classify(Layer::Connection, self.is_valid()))?;

        let refresher = if identity.authentication == AuthenticationModel::SasIndividual {
            let started = AuthenticationRefresher::start(
                Arc::clone(&self.cbs),
                identity,
                identity.audience(),
                timeout,
                Arc::clone(&self.metrics),
            )
            .await;
            match started {
                Ok(refresher) => Some(refresher),
                Err(e) => {
                    session.safe_close();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let resource = Arc::new(SessionResource::new(
            Arc::clone(&session),
            refresher,
            Arc::clone(&self.metrics),
        ));
        notify_on_close(&*session, &resource, listener);

        if session.is_closing() {
            resource.abort();
            return Err(Error::Disconnected(Layer::Session));
        }

        self.metrics.record_session_established();
        tracing::debug!(device = %identity, "AMQP session opened");
        Ok(resource)
    }

    fn stop_refresher(&self) {
        if let Some(refresher) = self.refresher.lock().take() {
            refresher.dispose();
        }
    }
}

impl Resource for ConnectionResource {
    fn is_valid(&self) -> bool {
        !self.connection.is_closing()
    }

    fn abort(&self) {
        self.stop_refresher();
        self.connection.safe_close();
    }

    fn dispose(&self) {
        self.abort();
    }

    fn on_underlying_closed(&self) {
        self.stop_refresher();
        self.metrics.record_connection_disconnected(&self.host_name);
    }
}

impl fmt::Debug for ConnectionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionResource")
            .field("host_name", &self.host_name)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Opens connections through a link-layer connector
pub struct ConnectionAllocator {
    connector: Arc<dyn AmqpConnector>,
    metrics: Arc<TransportMetrics>,
}

impl ConnectionAllocator {
    pub fn new(connector: Arc<dyn AmqpConnector>, metrics: Arc<TransportMetrics>) -> Self {
        Self { connector, metrics }
    }
}

#[async_trait]
impl ResourceAllocator<ConnectionResource> for ConnectionAllocator {
    async fn allocate_resource(
        &self,
        identity: &DeviceIdentity,
        listener: StatusListener<ConnectionResource>,
        timeout: Duration,
    ) -> Result<Arc<ConnectionResource>> {
        tracing::debug!(host = %identity.host_name, transport = ?identity.settings.transport_type, "Opening AMQP connection");

        let connection = self
            .connector
            .open_connection(&identity.settings, &identity.host_name, timeout)
            .await?;

        let cbs = match connection.create_cbs_link(timeout).await {
            Ok(cbs) => cbs,
            Err(e) => {
                connection.safe_close();
                return Err(e.classify(Layer::Connection, !connection.is_closing()));
            }
        };

        let refresher = if identity.authentication == AuthenticationModel::SasGrouped {
            let started = AuthenticationRefresher::start(
                Arc::clone(&cbs),
                identity,
                identity.audience(),
                timeout,
                Arc::clone(&self.metrics),
            )
            .await;
            match started {
                Ok(refresher) => Some(refresher),
                Err(e) => {
                    connection.safe_close();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let resource = Arc::new(ConnectionResource::new(
            identity.host_name.clone(),
            Arc::clone(&connection),
            cbs,
            refresher,
            Arc::clone(&self.metrics),
        ));
        notify_on_close(&*connection, &resource, listener);

        if connection.is_closing() {
            resource.abort();
            return Err(Error::Disconnected(Layer::Connection));
        }

        self.metrics.record_connection_established(&identity.host_name);
        tracing::info!(host = %identity.host_name, "AMQP connection opened");
        Ok(resource)
    }
}

/// A connection holder allocates sessions on whatever connection it
/// currently caches, reallocating the connection first if needed
#[async_trait]
impl ResourceAllocator<SessionResource> for ConnectionHolder {
    async fn allocate_resource(
        &self,
        identity: &DeviceIdentity,
        listener: StatusListener<SessionResource>,
        timeout: Duration,
    ) -> Result<Arc<SessionResource>> {
        let connection = self.ensure_resource(identity, timeout).await?;
        connection.allocate_session(identity, listener, timeout).await
    }
}
