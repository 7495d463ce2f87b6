//! Boundary with the AMQP link layer
//!
//! The connection core never speaks AMQP itself. Everything below a resource
//! wrapper (sockets, TLS, WebSocket tunnelling, framing, the protocol header
//! handshake) sits behind these traits and is supplied by the embedding
//! application or by test doubles.
//!
//! Every link-layer object is [`Closeable`]: it reports whether it is closing,
//! can be torn down immediately with `safe_close`, and delivers a one-shot
//! closed notification to the single handler registered with `on_closed`.

use async_trait::async_trait;
use stateful_amqp_core::{AmqpMessage, AmqpTransportSettings, LinkError, Outcome};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Result type for link-layer calls
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// One-shot notification fired when a link-layer object has closed
pub type ClosedHandler = Box<dyn FnOnce() + Send + 'static>;

/// Callback for messages pushed by a receiving link
pub type MessageListener = Arc<dyn Fn(AmqpMessage) + Send + Sync + 'static>;

/// Lifecycle surface shared by connections, sessions and links
pub trait Closeable: Send + Sync {
    /// True once a close has started, locally or remotely
    fn is_closing(&self) -> bool;

    /// Tear the object down immediately, swallowing errors; idempotent
    fn safe_close(&self);

    /// Register the closed notification
    ///
    /// Called exactly once per object. If the object is already closed the
    /// implementation may fire the handler immediately or never; the caller
    /// re-checks `is_closing` after registering.
    fn on_closed(&self, handler: ClosedHandler);
}

/// Opens network-level connections to a host
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn open_connection(
        &self,
        settings: &AmqpTransportSettings,
        host_name: &str,
        timeout: Duration,
    ) -> LinkResult<Arc<dyn AmqpConnection>>;
}

/// An open AMQP connection
#[async_trait]
pub trait AmqpConnection: Closeable {
    async fn open_session(&self, timeout: Duration) -> LinkResult<Arc<dyn AmqpSession>>;

    /// Create the claims-based-security link used for token exchange
    async fn create_cbs_link(&self, timeout: Duration) -> LinkResult<Arc<dyn CbsLink>>;
}

/// An open AMQP session
#[async_trait]
pub trait AmqpSession: Closeable {
    async fn open_sending_link(
        &self,
        settings: &LinkSettings,
        timeout: Duration,
    ) -> LinkResult<Arc<dyn SendingLink>>;

    async fn open_receiving_link(
        &self,
        settings: &LinkSettings,
        timeout: Duration,
    ) -> LinkResult<Arc<dyn ReceivingLink>>;
}

/// An attached sending link
#[async_trait]
pub trait SendingLink: Closeable {
    async fn send(
        &self,
        message: AmqpMessage,
        delivery_tag: Uuid,
        timeout: Duration,
    ) -> LinkResult<Outcome>;
}

/// An attached receiving link
#[async_trait]
pub trait ReceivingLink: Closeable {
    /// Wait up to `timeout` for the next message; `None` when none arrived
    async fn receive(&self, timeout: Duration) -> LinkResult<Option<AmqpMessage>>;

    /// Settle the delivery identified by `delivery_tag`
    async fn dispose_message(
        &self,
        delivery_tag: Uuid,
        outcome: Outcome,
        timeout: Duration,
    ) -> LinkResult<Outcome>;

    /// Accept a message previously pushed to the listener
    fn dispose_delivery(&self, message: &AmqpMessage) -> LinkResult<()>;

    /// Push incoming messages to `listener` instead of buffering them
    fn register_message_listener(&self, listener: MessageListener);
}

/// When the service expects the next token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOn {
    At(Instant),
    /// The credential does not expire
    Never,
}

/// A put-token request sent on the CBS link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    /// `amqps://<host>:5671`
    pub namespace_address: String,
    pub audience: String,
    /// Access rights the token must grant
    pub claims: Vec<String>,
}

/// The claims-based-security link of a connection
#[async_trait]
pub trait CbsLink: Send + Sync {
    /// Put a token for `request` and report when it must be refreshed
    async fn send_token(&self, request: &TokenRequest, timeout: Duration) -> LinkResult<RefreshOn>;
}

/// Sender settle mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderSettleMode {
    Unsettled,
    Settled,
    Mixed,
}

/// Receiver settle mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    /// Settle on receipt
    First,
    /// Settle after the sender settles
    Second,
}

/// Link direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Sender,
    Receiver,
}

/// Everything the link layer needs to attach a link
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    pub name: String,
    pub role: LinkRole,
    pub source: Option<String>,
    pub target: Option<String>,
    pub sender_settle_mode: Option<SenderSettleMode>,
    pub receiver_settle_mode: Option<ReceiverSettleMode>,
    /// Link credit for receivers
    pub total_link_credit: u32,
    pub auto_send_flow: bool,
    /// Attach properties
    pub properties: BTreeMap<String, String>,
}

impl LinkSettings {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Insert or replace an attach property
    pub fn upsert_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }
}
