//! stateful-amqp - connection management for AMQP device transports
//!
//! This is the convenience crate that re-exports the sub-crates. Use it if
//! you want a single dependency for the whole connection core.
//!
//! # Architecture
//!
//! - **stateful-amqp-core**: Identities, settings, message types, error
//!   handling, observability
//! - **stateful-amqp-client**: Resource holders, allocators, token
//!   refreshers, the connection pool and the reconnecting transport
//!
//! The link layer (sockets, TLS, AMQP framing) is not part of this crate:
//! implement [`client::AmqpConnector`] and the traits it returns on top of
//! your AMQP library of choice.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use stateful_amqp::{AmqpTransport, TransportBuilder};
//! use stateful_amqp::client::{AmqpConnector, ExponentialBackoff};
//! use stateful_amqp::core::{AmqpTransportSettings, AuthenticationModel, DeviceIdentity};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(connector: Arc<dyn AmqpConnector>) -> stateful_amqp::core::Result<()> {
//! let settings = AmqpTransportSettings::from_json(r#"{"operation_timeout_ms": 30000}"#)?;
//! let identity = DeviceIdentity::new("hub.example.net", "thermostat-7", AuthenticationModel::SasIndividual, settings);
//!
//! let transport: AmqpTransport = TransportBuilder::new(identity)
//!     .with_connector(connector)
//!     .with_retry(|| ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(60)).with_max_retries(10))
//!     .build()?;
//!
//! transport.open(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

// Re-export all public APIs from sub-crates
pub use stateful_amqp_client as client;
pub use stateful_amqp_core as core;

// Convenience re-exports of the most commonly used types
pub use stateful_amqp_client::{AmqpTransport, ConnectionPoolManager, TransportBuilder};
pub use stateful_amqp_core::{AmqpTransportSettings, DeviceIdentity, Error, Result};
