//! Transport settings consumed by the connection core
//!
//! These settings are owned by the device client and handed to the transport
//! at construction. The core only reads them: the transport type decides how
//! the connector opens the socket, the pool settings decide whether a
//! connection holder is shared, and the operation timeout bounds each
//! reconnection attempt.
//!
//! Settings deserialize from JSON with serde. Durations are expressed in
//! milliseconds and every field has a default, so a partial document is fine:
//!
//! ```rust
//! use stateful_amqp_core::{AmqpTransportSettings, TransportType};
//! use std::time::Duration;
//!
//! let settings = AmqpTransportSettings::from_json(
//!     r#"{ "transport_type": "amqp_web_socket_only", "pool": { "pooling": true, "max_pool_size": 4 } }"#,
//! ).unwrap();
//!
//! assert_eq!(settings.transport_type, TransportType::AmqpWebSocketOnly);
//! assert_eq!(settings.operation_timeout, Duration::from_secs(60));
//! assert!(settings.pool.pooling);
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bound for a single link-layer operation
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default link credit granted to receiving links
pub const DEFAULT_PREFETCH_COUNT: u32 = 50;

/// Default number of pooled connections per host and scope
pub const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// How the connector reaches the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    /// AMQP over TLS on port 5671
    AmqpTcpOnly,
    /// AMQP tunnelled through a secure WebSocket on port 443
    AmqpWebSocketOnly,
}

impl Default for TransportType {
    fn default() -> Self {
        TransportType::AmqpTcpOnly
    }
}

/// Connection sharing policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolSettings {
    /// Share connections between identities with compatible credentials
    pub pooling: bool,
    /// Number of connection slots per host (and per key name for grouped SAS)
    pub max_pool_size: u32,
}

impl Default for ConnectionPoolSettings {
    fn default() -> Self {
        Self {
            pooling: false,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
        }
    }
}

/// Settings the transport core reads from the device client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpTransportSettings {
    pub transport_type: TransportType,
    /// Upper bound for one reconnection attempt and for link-layer calls
    /// that do not carry a caller deadline
    #[serde(with = "duration_millis", rename = "operation_timeout_ms")]
    pub operation_timeout: Duration,
    /// Link credit for receiving links; zero disables automatic flow
    pub prefetch_count: u32,
    pub pool: ConnectionPoolSettings,
    /// Proxy URI used by the WebSocket transport
    pub proxy: Option<String>,
    /// Reference (path or store name) to the client certificate for X.509 identities
    pub client_certificate: Option<String>,
}

impl Default for AmqpTransportSettings {
    fn default() -> Self {
        Self {
            transport_type: TransportType::default(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            pool: ConnectionPoolSettings::default(),
            proxy: None,
            client_certificate: None,
        }
    }
}

impl AmqpTransportSettings {
    /// Create settings for the given transport type with every other field defaulted
    pub fn new(transport_type: TransportType) -> Self {
        Self {
            transport_type,
            ..Default::default()
        }
    }

    /// Parse and validate settings from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the pool and link factory cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.pool.pooling && self.pool.max_pool_size == 0 {
            return Err(Error::Configuration(
                "max_pool_size must be at least 1 when pooling is enabled".into(),
            ));
        }
        if self.operation_timeout.is_zero() {
            return Err(Error::Configuration(
                "operation_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.proxy.is_some() && self.transport_type == TransportType::AmqpTcpOnly {
            return Err(Error::Configuration(
                "a proxy is only supported with amqp_web_socket_only".into(),
            ));
        }
        Ok(())
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Enable connection pooling with the given pool size
    pub fn with_pooling(mut self, max_pool_size: u32) -> Self {
        self.pool = ConnectionPoolSettings {
            pooling: true,
            max_pool_size,
        };
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_client_certificate(mut self, certificate: impl Into<String>) -> Self {
        self.client_certificate = Some(certificate.into());
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
