//! Core types for the stateful AMQP device transport
//!
//! This crate holds everything the connection-management layer shares with
//! its callers and with the link layer beneath it:
//!
//! - **Error handling**: the transient/fatal error taxonomy and the mapping
//!   from link-layer faults
//! - **Types**: device identities, holder and resource status, channels,
//!   messages and delivery outcomes
//! - **Settings**: serde-backed transport and pool configuration
//! - **Observability**: tracing subscriber and OpenTelemetry export setup
//!
//! The `stateful-amqp-client` crate builds the holders, pool and transport on
//! top of these types.
//!
//! # Example
//!
//! ```rust
//! use stateful_amqp_core::{AmqpTransportSettings, AuthenticationModel, DeviceIdentity};
//!
//! let settings = AmqpTransportSettings::default().with_pooling(10);
//! let identity = DeviceIdentity::new("hub.example.net", "thermostat-7", AuthenticationModel::SasIndividual, settings);
//!
//! assert!(identity.is_pooling());
//! assert_eq!(identity.audience(), "hub.example.net/devices/thermostat-7");
//! ```

pub mod error;
pub mod observability;
pub mod settings;
pub mod types;

pub use error::{Error, Layer, LinkError, LinkErrorKind, Result};
pub use observability::{init_observability, shutdown_observability, ObservabilityConfig};
pub use settings::{AmqpTransportSettings, ConnectionPoolSettings, TransportType};
pub use types::{
    AmqpMessage, AuthenticationModel, DeviceIdentity, OperationStatus, Outcome, ResourceStatus,
    Topic,
};
