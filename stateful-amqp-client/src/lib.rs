//! Stateful AMQP connection management for device clients
//!
//! This crate keeps a device's AMQP connection, session and links alive on
//! top of an abstract link layer. Each layer lives in a
//! [`ResourceHolder`]: a cache plus a small state machine that allocates on
//! demand, hands the same resource to concurrent callers and notices when
//! the network takes it away.
//!
//! # Core Features
//!
//! - **Resource holders**: single-flight allocation, open/close/dispose
//!   lifecycle, stale-notification filtering
//! - **Connection pooling**: identities with compatible credentials share
//!   connections per host
//! - **Token renewal**: CBS tokens are refreshed in the background
//! - **Auto-Reconnection**: configurable retry schedulers, at most one
//!   reconnect in flight per transport
//! - **Observability**: tracing spans and OpenTelemetry metrics
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use stateful_amqp_client::{AmqpConnector, ConnectionPoolManager, TransportBuilder, TransportMetrics};
//! use stateful_amqp_core::{AmqpMessage, AmqpTransportSettings, AuthenticationModel, DeviceIdentity, Topic};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(connector: Arc<dyn AmqpConnector>) -> stateful_amqp_core::Result<()> {
//! let pool = Arc::new(ConnectionPoolManager::new(connector, Arc::new(TransportMetrics::new())));
//! let settings = AmqpTransportSettings::default().with_pooling(10);
//! let identity = DeviceIdentity::new("hub.example.net", "thermostat-7", AuthenticationModel::SasIndividual, settings);
//!
//! let transport = TransportBuilder::new(identity)
//!     .with_pool(pool)
//!     .on_message_received(|topic, message| println!("{topic}: {} bytes", message.body.len()))
//!     .build()?;
//!
//! transport.open(Duration::from_secs(30)).await?;
//! transport.enable_methods(Duration::from_secs(30)).await?;
//! let outcome = transport
//!     .send_message(Topic::Message, AmqpMessage::new(b"21.5".to_vec()), Duration::from_secs(30))
//!     .await?;
//! assert!(outcome.is_accepted());
//! transport.close(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod connection_state;
mod holder;
mod link;
mod link_factory;
mod link_layer;
mod metrics;
mod pool;
mod refresher;
mod resource;
mod retry;
mod session;
mod transport;
mod transport_builder;

pub use connection::{ConnectionAllocator, ConnectionHolder, ConnectionResource};
pub use connection_state::{StateTracker, TransportState};
pub use holder::{DisconnectCallback, ResourceHolder, Subscription};
pub use link::{
    ReceivingLinkAllocator, ReceivingLinkHolder, ReceivingLinkResource, SendingLinkAllocator,
    SendingLinkHolder, SendingLinkResource,
};
pub use link_factory::{
    LinkFactory, API_VERSION, API_VERSION_PROPERTY, CHANNEL_CORRELATION_ID_PROPERTY,
    CLIENT_VERSION_PROPERTY, TIMEOUT_PROPERTY,
};
pub use link_layer::{
    AmqpConnection, AmqpConnector, AmqpSession, CbsLink, ClosedHandler, Closeable, LinkResult,
    LinkRole, LinkSettings, MessageListener, ReceiverSettleMode, ReceivingLink, RefreshOn,
    SenderSettleMode, SendingLink, TokenRequest,
};
pub use metrics::TransportMetrics;
pub use pool::ConnectionPoolManager;
pub use refresher::{AuthenticationRefresher, RefresherStatus, DEVICE_CONNECT_CLAIM};
pub use resource::{Resource, ResourceAllocator, ResourceStatusListener, StatusListener};
pub use retry::{ExponentialBackoff, FixedRate, NoRetry, RetryScheduler, RetrySchedulerSupplier};
pub use session::{SessionHolder, SessionResource};
pub use transport::{AmqpTransport, DisconnectedCallback, MessageCallback};
pub use transport_builder::TransportBuilder;
