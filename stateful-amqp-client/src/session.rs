//! AMQP session resource
//!
//! Links are allocated from a live [`SessionResource`]. Every allocation
//! follows the same rules as the layers above it: fail fast on a dead
//! session, map link-layer faults (a canceled or invalid open on a session
//! that has meanwhile closed reports the session as disconnected), wire the
//! closed notification and re-check liveness before handing the link out.

use crate::holder::ResourceHolder;
use crate::link::{ReceivingLinkResource, SendingLinkResource};
use crate::link_layer::{AmqpSession, LinkSettings, MessageListener};
use crate::metrics::TransportMetrics;
use crate::refresher::AuthenticationRefresher;
use crate::resource::{notify_on_close, Resource, StatusListener};
use parking_lot::Mutex;
use stateful_amqp_core::{Error, Layer, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Holder caching one AMQP session
pub type SessionHolder = ResourceHolder<SessionResource>;

/// A live AMQP session
pub struct SessionResource {
    session: Arc<dyn AmqpSession>,
    refresher: Mutex<Option<AuthenticationRefresher>>,
    metrics: Arc<TransportMetrics>,
}

impl SessionResource {
    pub(crate) fn new(
        session: Arc<dyn AmqpSession>,
        refresher: Option<AuthenticationRefresher>,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        Self {
            session,
            refresher: Mutex::new(refresher),
            metrics,
        }
    }

    pub async fn allocate_sending_link(
        &self,
        settings: &LinkSettings,
        listener: StatusListener<SendingLinkResource>,
        timeout: Duration,
    ) -> Result<Arc<SendingLinkResource>> {
        if !self.is_valid() {
            return Err(Error::Disconnected(Layer::Session));
        }

        let link = self
            .session
            .open_sending_link(settings, timeout)
            .await
            .map_err(|e| e.classify(Layer::Session, self.is_valid()))?;

        let resource = Arc::new(SendingLinkResource::new(settings.name.clone(), Arc::clone(&link)));
        notify_on_close(&*link, &resource, listener);

        if link.is_closing() {
            resource.abort();
            return Err(Error::Disconnected(Layer::Link));
        }

        tracing::debug!(link = %settings.name, "Sending link attached");
        Ok(resource)
    }

    /// Open a receiving link; messages are pushed to `message_listener` when
    /// one is given, otherwise they wait for `receive`
    pub async fn allocate_receiving_link(
        &self,
        settings: &LinkSettings,
        message_listener: Option<MessageListener>,
        listener: StatusListener<ReceivingLinkResource>,
        timeout: Duration,
    ) -> Result<Arc<ReceivingLinkResource>> {
        if !self.is_valid() {
            return Err(Error::Disconnected(Layer::Session));
        }

        let link = self
            .session
            .open_receiving_link(settings, timeout)
            .await
            .map_err(|e| e.classify(Layer::Session, self.is_valid()))?;

        let resource = Arc::new(ReceivingLinkResource::new(settings.name.clone(), Arc::clone(&link)));
        notify_on_close(&*link, &resource, listener);

        if link.is_closing() {
            resource.abort();
            return Err(Error::Disconnected(Layer::Link));
        }

        if let Some(message_listener) = message_listener {
            link.register_message_listener(message_listener);
        }

        tracing::debug!(link = %settings.name, "Receiving link attached");
        Ok(resource)
    }

    fn stop_refresher(&self) {
        if let Some(refresher) = self.refresher.lock().take() {
            refresher.dispose();
        }
    }
}

impl Resource for SessionResource {
    fn is_valid(&self) -> bool {
        !self.session.is_closing()
    }

    fn abort(&self) {
        self.stop_refresher();
        self.session.safe_close();
    }

    fn dispose(&self) {
        self.abort();
    }

    fn on_underlying_closed(&self) {
        self.stop_refresher();
        self.metrics.record_session_disconnected();
    }
}

impl fmt::Debug for SessionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionResource")
            .field("valid", &self.is_valid())
            .finish()
    }
}
