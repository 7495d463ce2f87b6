//! Sending and receiving link resources
//!
//! Link allocators hold the session holder of their transport: every
//! allocation first makes sure the session is live (reallocating it, and the
//! connection beneath it, if needed), then attaches a link with freshly
//! built settings for its channel.

use crate::holder::ResourceHolder;
use crate::link_factory::{LinkFactory, TIMEOUT_PROPERTY};
use crate::link_layer::{MessageListener, ReceivingLink, SendingLink};
use crate::resource::{Resource, ResourceAllocator, StatusListener};
use crate::session::{SessionHolder, SessionResource};
use async_trait::async_trait;
use stateful_amqp_core::{AmqpMessage, DeviceIdentity, Layer, Outcome, Result, Topic};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub type SendingLinkHolder = ResourceHolder<SendingLinkResource>;
pub type ReceivingLinkHolder = ResourceHolder<ReceivingLinkResource>;

/// A live sending link
pub struct SendingLinkResource {
    name: String,
    link: Arc<dyn SendingLink>,
}

impl SendingLinkResource {
    pub(crate) fn new(name: String, link: Arc<dyn SendingLink>) -> Self {
        Self { name, link }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send `message` under a fresh delivery tag
    pub async fn send(&self, message: AmqpMessage, timeout: Duration) -> Result<Outcome> {
        let delivery_tag = Uuid::new_v4();
        self.link
            .send(message, delivery_tag, timeout)
            .await
            .map_err(|e| e.classify(Layer::Link, self.is_valid()))
    }
}

impl Resource for SendingLinkResource {
    fn is_valid(&self) -> bool {
        !self.link.is_closing()
    }

    fn abort(&self) {
        self.link.safe_close();
    }

    fn dispose(&self) {
        self.link.safe_close();
    }
}

impl fmt::Debug for SendingLinkResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendingLinkResource")
            .field("name", &self.name)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// A live receiving link
pub struct ReceivingLinkResource {
    name: String,
    link: Arc<dyn ReceivingLink>,
}

impl ReceivingLinkResource {
    pub(crate) fn new(name: String, link: Arc<dyn ReceivingLink>) -> Self {
        Self { name, link }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `timeout` for the next message
    ///
    /// The returned message's lock token is its delivery tag, which
    /// `dispose_message` later settles.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<AmqpMessage>> {
        let received = self
            .link
            .receive(timeout)
            .await
            .map_err(|e| e.classify(Layer::Link, self.is_valid()))?;
        Ok(received.map(|mut message| {
            message.lock_token = message.delivery_tag.map(|tag| tag.to_string());
            message
        }))
    }

    pub async fn dispose_message(
        &self,
        delivery_tag: Uuid,
        outcome: Outcome,
        timeout: Duration,
    ) -> Result<Outcome> {
        self.link
            .dispose_message(delivery_tag, outcome, timeout)
            .await
            .map_err(|e| e.classify(Layer::Link, self.is_valid()))
    }

    /// Accept a message that was pushed to the message listener
    pub fn dispose_delivery(&self, message: &AmqpMessage) -> Result<()> {
        self.link
            .dispose_delivery(message)
            .map_err(|e| e.classify(Layer::Link, self.is_valid()))
    }
}

impl Resource for ReceivingLinkResource {
    fn is_valid(&self) -> bool {
        !self.link.is_closing()
    }

    fn abort(&self) {
        self.link.safe_close();
    }

    fn dispose(&self) {
        self.link.safe_close();
    }
}

impl fmt::Debug for ReceivingLinkResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivingLinkResource")
            .field("name", &self.name)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl ReceivingLinkHolder {
    /// Settle a pushed message on the cached link
    ///
    /// Returns `Ok(false)` when there is no live link to settle it on.
    pub fn dispose_delivery(&self, message: &AmqpMessage) -> Result<bool> {
        match self.current() {
            Some(link) => link.dispose_delivery(message).map(|_| true),
            None => Ok(false),
        }
    }
}

/// Attaches the sending link of one channel
pub struct SendingLinkAllocator {
    session: SessionHolder,
    factory: LinkFactory,
    topic: Topic,
}

impl SendingLinkAllocator {
    pub fn new(session: SessionHolder, factory: LinkFactory, topic: Topic) -> Self {
        Self {
            session,
            factory,
            topic,
        }
    }
}

#[async_trait]
impl ResourceAllocator<SendingLinkResource> for SendingLinkAllocator {
    async fn allocate_resource(
        &self,
        identity: &DeviceIdentity,
        listener: StatusListener<SendingLinkResource>,
        timeout: Duration,
    ) -> Result<Arc<SendingLinkResource>> {
        let session: Arc<SessionResource> = self.session.ensure_resource(identity, timeout).await?;
        let mut settings = self.factory.sending_link_settings(identity, self.topic);
        settings.upsert_property(TIMEOUT_PROPERTY, timeout.as_millis().to_string());
        session.allocate_sending_link(&settings, listener, timeout).await
    }
}

/// Attaches the receiving link of one channel
pub struct ReceivingLinkAllocator {
    session: SessionHolder,
    factory: LinkFactory,
    topic: Topic,
    message_listener: Option<MessageListener>,
}

impl ReceivingLinkAllocator {
    pub fn new(
        session: SessionHolder,
        factory: LinkFactory,
        topic: Topic,
        message_listener: Option<MessageListener>,
    ) -> Self {
        Self {
            session,
            factory,
            topic,
            message_listener,
        }
    }
}

#[async_trait]
impl ResourceAllocator<ReceivingLinkResource> for ReceivingLinkAllocator {
    async fn allocate_resource(
        &self,
        identity: &DeviceIdentity,
        listener: StatusListener<ReceivingLinkResource>,
        timeout: Duration,
    ) -> Result<Arc<ReceivingLinkResource>> {
        let session = self.session.ensure_resource(identity, timeout).await?;
        let settings = self.factory.receiving_link_settings(identity, self.topic);
        session
            .allocate_receiving_link(&settings, self.message_listener.clone(), listener, timeout)
            .await
    }
}
