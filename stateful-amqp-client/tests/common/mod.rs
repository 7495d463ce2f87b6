//! Common test utilities for stateful-amqp-client integration tests
//!
//! This module provides an in-memory link layer so transports can be driven
//! end to end without a hub. A [`MockNetwork`] records every object it opens
//! and can inject failures or drop sessions and connections on demand.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use stateful_amqp_client::{
    AmqpConnection, AmqpConnector, AmqpSession, CbsLink, ClosedHandler, Closeable, LinkResult,
    LinkSettings, MessageListener, ReceivingLink, RefreshOn, SendingLink, TokenRequest,
};
use stateful_amqp_core::{
    AmqpMessage, AmqpTransportSettings, AuthenticationModel, DeviceIdentity, LinkError, Outcome,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Close bookkeeping shared by every mock object
#[derive(Default)]
pub struct CloseState {
    closing: AtomicBool,
    handler: Mutex<Option<ClosedHandler>>,
    children: Mutex<Vec<Arc<dyn Closeable>>>,
}

impl CloseState {
    fn adopt(&self, child: Arc<dyn Closeable>) {
        self.children.lock().push(child);
    }

    /// Close children first, then fire this object's handler once
    fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            child.safe_close();
        }
        let handler = self.handler.lock().take();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn on_closed(&self, handler: ClosedHandler) {
        *self.handler.lock() = Some(handler);
    }
}

/// Shared state of one simulated hub
#[derive(Default)]
pub struct MockNetwork {
    pub connection_attempts: AtomicUsize,
    pub session_attempts: AtomicUsize,
    pub link_attempts: AtomicUsize,
    pub tokens_sent: AtomicUsize,
    pub connection_failures: Mutex<VecDeque<LinkError>>,
    pub session_failures: Mutex<VecDeque<LinkError>>,
    pub token_lifetime: Mutex<Option<Duration>>,
    pub connections: Mutex<Vec<Arc<MockConnection>>>,
    pub sessions: Mutex<Vec<Arc<MockSession>>>,
    pub sending_links: Mutex<Vec<Arc<MockSendingLink>>>,
    pub receiving_links: Mutex<Vec<Arc<MockReceivingLink>>>,
    pub token_requests: Mutex<Vec<TokenRequest>>,
    /// Messages waiting to be pulled by receiving links
    pub inbox: Mutex<VecDeque<AmqpMessage>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn AmqpConnector> {
        Arc::new(MockConnector {
            network: Arc::clone(self),
        })
    }

    pub fn connection_attempts(&self) -> usize {
        self.connection_attempts.load(Ordering::SeqCst)
    }

    pub fn session_attempts(&self) -> usize {
        self.session_attempts.load(Ordering::SeqCst)
    }

    pub fn tokens_sent(&self) -> usize {
        self.tokens_sent.load(Ordering::SeqCst)
    }

    pub fn fail_next_sessions(&self, errors: impl IntoIterator<Item = LinkError>) {
        self.session_failures.lock().extend(errors);
    }

    pub fn fail_next_connections(&self, errors: impl IntoIterator<Item = LinkError>) {
        self.connection_failures.lock().extend(errors);
    }

    pub fn set_token_lifetime(&self, lifetime: Duration) {
        *self.token_lifetime.lock() = Some(lifetime);
    }

    /// Close the most recently opened session, as a peer detach would
    pub fn drop_latest_session(&self) {
        let session = self.sessions.lock().last().cloned();
        if let Some(session) = session {
            session.state.close();
        }
    }

    /// Close the most recently opened connection, as a network failure would
    pub fn drop_latest_connection(&self) {
        let connection = self.connections.lock().last().cloned();
        if let Some(connection) = connection {
            connection.state.close();
        }
    }

    pub fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| !c.state.is_closing())
            .count()
    }

    pub fn open_links_with_suffix(&self, suffix: &str) -> usize {
        let senders = self
            .sending_links
            .lock()
            .iter()
            .filter(|l| l.settings.name.ends_with(suffix) && !l.state.is_closing())
            .count();
        let receivers = self
            .receiving_links
            .lock()
            .iter()
            .filter(|l| l.settings.name.ends_with(suffix) && !l.state.is_closing())
            .count();
        senders + receivers
    }

    pub fn latest_receiver(&self, suffix: &str) -> Option<Arc<MockReceivingLink>> {
        self.receiving_links
            .lock()
            .iter()
            .rev()
            .find(|l| l.settings.name.ends_with(suffix))
            .cloned()
    }

    pub fn latest_sender(&self, suffix: &str) -> Option<Arc<MockSendingLink>> {
        self.sending_links
            .lock()
            .iter()
            .rev()
            .find(|l| l.settings.name.ends_with(suffix))
            .cloned()
    }

    pub fn sent_messages(&self) -> usize {
        self.sending_links
            .lock()
            .iter()
            .map(|l| l.sent.lock().len())
            .sum()
    }
}

pub struct MockConnector {
    network: Arc<MockNetwork>,
}

#[async_trait]
impl AmqpConnector for MockConnector {
    async fn open_connection(
        &self,
        _settings: &AmqpTransportSettings,
        _host_name: &str,
        _timeout: Duration,
    ) -> LinkResult<Arc<dyn AmqpConnection>> {
        self.network.connection_attempts.fetch_add(1, Ordering::SeqCst);
        let failure = self.network.connection_failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        let connection = Arc::new(MockConnection {
            network: Arc::clone(&self.network),
            state: CloseState::default(),
        });
        self.network.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub struct MockConnection {
    network: Arc<MockNetwork>,
    pub state: CloseState,
}

impl Closeable for MockConnection {
    fn is_closing(&self) -> bool {
        self.state.is_closing()
    }

    fn safe_close(&self) {
        self.state.close();
    }

    fn on_closed(&self, handler: ClosedHandler) {
        self.state.on_closed(handler);
    }
}

#[async_trait]
impl AmqpConnection for MockConnection {
    async fn open_session(&self, _timeout: Duration) -> LinkResult<Arc<dyn AmqpSession>> {
        self.network.session_attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.is_closing() {
            return Err(LinkError::invalid_operation("connection is closed"));
        }
        let failure = self.network.session_failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        let session = Arc::new(MockSession {
            network: Arc::clone(&self.network),
            state: CloseState::default(),
        });
        self.state.adopt(Arc::clone(&session) as Arc<dyn Closeable>);
        self.network.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }

    async fn create_cbs_link(&self, _timeout: Duration) -> LinkResult<Arc<dyn CbsLink>> {
        Ok(Arc::new(MockCbs {
            network: Arc::clone(&self.network),
        }))
    }
}

pub struct MockSession {
    network: Arc<MockNetwork>,
    pub state: CloseState,
}

impl Closeable for MockSession {
    fn is_closing(&self) -> bool {
        self.state.is_closing()
    }

    fn safe_close(&self) {
        self.state.close();
    }

    fn on_closed(&self, handler: ClosedHandler) {
        self.state.on_closed(handler);
    }
}

#[async_trait]
impl AmqpSession for MockSession {
    async fn open_sending_link(
        &self,
        settings: &LinkSettings,
        _timeout: Duration,
    ) -> LinkResult<Arc<dyn SendingLink>> {
        self.network.link_attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.is_closing() {
            return Err(LinkError::invalid_operation("session is closed"));
        }
        let link = Arc::new(MockSendingLink {
            settings: settings.clone(),
            state: CloseState::default(),
            sent: Mutex::new(Vec::new()),
        });
        self.state.adopt(Arc::clone(&link) as Arc<dyn Closeable>);
        self.network.sending_links.lock().push(Arc::clone(&link));
        Ok(link)
    }

    async fn open_receiving_link(
        &self,
        settings: &LinkSettings,
        _timeout: Duration,
    ) -> LinkResult<Arc<dyn ReceivingLink>> {
        self.network.link_attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.is_closing() {
            return Err(LinkError::invalid_operation("session is closed"));
        }
        let link = Arc::new(MockReceivingLink {
            network: Arc::clone(&self.network),
            settings: settings.clone(),
            state: CloseState::default(),
            listener: Mutex::new(None),
            settled: Mutex::new(Vec::new()),
            accepted: Mutex::new(Vec::new()),
        });
        self.state.adopt(Arc::clone(&link) as Arc<dyn Closeable>);
        self.network.receiving_links.lock().push(Arc::clone(&link));
        Ok(link)
    }
}

pub struct MockSendingLink {
    pub settings: LinkSettings,
    pub state: CloseState,
    pub sent: Mutex<Vec<(Uuid, AmqpMessage)>>,
}

impl Closeable for MockSendingLink {
    fn is_closing(&self) -> bool {
        self.state.is_closing()
    }

    fn safe_close(&self) {
        self.state.close();
    }

    fn on_closed(&self, handler: ClosedHandler) {
        self.state.on_closed(handler);
    }
}

#[async_trait]
impl SendingLink for MockSendingLink {
    async fn send(
        &self,
        message: AmqpMessage,
        delivery_tag: Uuid,
        _timeout: Duration,
    ) -> LinkResult<Outcome> {
        if self.state.is_closing() {
            return Err(LinkError::invalid_operation("link is closed"));
        }
        self.sent.lock().push((delivery_tag, message));
        Ok(Outcome::Accepted)
    }
}

pub struct MockReceivingLink {
    network: Arc<MockNetwork>,
    pub settings: LinkSettings,
    pub state: CloseState,
    listener: Mutex<Option<MessageListener>>,
    pub settled: Mutex<Vec<(Uuid, Outcome)>>,
    pub accepted: Mutex<Vec<AmqpMessage>>,
}

impl MockReceivingLink {
    /// Deliver `message` to the registered listener; false if none
    pub fn push(&self, message: AmqpMessage) -> bool {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => {
                listener(message);
                true
            }
            None => false,
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }
}

impl Closeable for MockReceivingLink {
    fn is_closing(&self) -> bool {
        self.state.is_closing()
    }

    fn safe_close(&self) {
        self.state.close();
    }

    fn on_closed(&self, handler: ClosedHandler) {
        self.state.on_closed(handler);
    }
}

#[async_trait]
impl ReceivingLink for MockReceivingLink {
    async fn receive(&self, _timeout: Duration) -> LinkResult<Option<AmqpMessage>> {
        if self.state.is_closing() {
            return Err(LinkError::invalid_operation("link is closed"));
        }
        let next = self.network.inbox.lock().pop_front();
        Ok(next.map(|mut message| {
            message.delivery_tag.get_or_insert_with(Uuid::new_v4);
            message
        }))
    }

    async fn dispose_message(
        &self,
        delivery_tag: Uuid,
        outcome: Outcome,
        _timeout: Duration,
    ) -> LinkResult<Outcome> {
        if self.state.is_closing() {
            return Err(LinkError::invalid_operation("link is closed"));
        }
        self.settled.lock().push((delivery_tag, outcome.clone()));
        Ok(outcome)
    }

    fn dispose_delivery(&self, message: &AmqpMessage) -> LinkResult<()> {
        self.accepted.lock().push(message.clone());
        Ok(())
    }

    fn register_message_listener(&self, listener: MessageListener) {
        *self.listener.lock() = Some(listener);
    }
}

pub struct MockCbs {
    network: Arc<MockNetwork>,
}

#[async_trait]
impl CbsLink for MockCbs {
    async fn send_token(&self, request: &TokenRequest, _timeout: Duration) -> LinkResult<RefreshOn> {
        self.network.tokens_sent.fetch_add(1, Ordering::SeqCst);
        self.network.token_requests.lock().push(request.clone());
        let lifetime = *self.network.token_lifetime.lock();
        Ok(match lifetime {
            Some(lifetime) => RefreshOn::At(Instant::now() + lifetime),
            None => RefreshOn::Never,
        })
    }
}

/// Device identity on the mock hub
pub fn identity(device_id: &str, authentication: AuthenticationModel) -> DeviceIdentity {
    identity_with(device_id, authentication, AmqpTransportSettings::default())
}

pub fn identity_with(
    device_id: &str,
    authentication: AuthenticationModel,
    settings: AmqpTransportSettings,
) -> DeviceIdentity {
    DeviceIdentity::new("hub.example.net", device_id, authentication, settings)
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Await `future` with a generous test timeout
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("operation timed out")
}

/// Counter suitable for callbacks
pub fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Arc::clone(&count);
    (count, move || {
        handle.fetch_add(1, Ordering::SeqCst);
    })
}

/// Route transport logs to the test output; set RUST_LOG to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const TIMEOUT: Duration = Duration::from_secs(2);
