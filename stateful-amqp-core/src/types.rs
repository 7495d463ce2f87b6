//! Identity, status and message types shared by the transport layers
//!
//! # Identities
//!
//! A [`DeviceIdentity`] names one device (or module) on one hub, together
//! with how it authenticates and the transport settings it was created with.
//! The connection pool keys on it: the authentication model decides whether
//! the identity may share a connection, and [`DeviceIdentity::pool_hash`]
//! picks the slot.
//!
//! # Status
//!
//! Two small enums drive every resource holder:
//!
//! - **OperationStatus**: what the caller asked for (open, closed, disposed)
//! - **ResourceStatus**: what the network reported (connected, disconnected)
//!
//! Keeping them separate lets a holder reconcile the caller's intent with the
//! network's state after every allocation.

use crate::settings::AmqpTransportSettings;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Secure AMQP port used to build the token namespace address
pub const AMQPS_PORT: u16 = 5671;

/// Holder-level lifecycle status
///
/// ```text
/// Inactive ⇄ Active
///     ↘      ↙
///     Disposed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    /// The holder should maintain a live resource
    Active,
    /// The holder must not hold a live resource but may be reopened
    Inactive,
    /// The holder is permanently unusable
    Disposed,
}

/// Status reported by a resource to its holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceStatus {
    Connected,
    Disconnected,
}

/// How an identity authenticates against the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationModel {
    /// Shared access signature scoped to a single device or module
    SasIndividual,
    /// Shared access signature from a hub-level policy shared by many devices
    SasGrouped,
    /// Client certificate presented during the TLS handshake
    X509,
}

/// Logical channel multiplexed over the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    /// Telemetry out, cloud-to-device messages (or module events) in
    Message,
    /// Direct method requests and responses
    Method,
    /// Twin get, patch and desired-property notifications
    Twin,
    /// Device streaming requests
    DeviceStreaming,
}

impl Topic {
    /// Every channel, in link creation order
    pub const ALL: [Topic; 4] = [
        Topic::Message,
        Topic::Method,
        Topic::Twin,
        Topic::DeviceStreaming,
    ];
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Message => f.write_str("message"),
            Topic::Method => f.write_str("method"),
            Topic::Twin => f.write_str("twin"),
            Topic::DeviceStreaming => f.write_str("device_streaming"),
        }
    }
}

/// Delivery outcome returned by the peer or applied to a received message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Accepted,
    Rejected {
        /// AMQP error condition, if the peer supplied one
        condition: Option<String>,
    },
    Released,
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
    },
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted)
    }
}

/// An AMQP message as seen by the transport core
///
/// Payload encoding is owned by the device client; the core only moves bytes
/// and application properties around and tracks delivery tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpMessage {
    /// Delivery tag assigned by the link layer on send or receive
    pub delivery_tag: Option<Uuid>,
    /// Lock token derived from the delivery tag of a received message
    pub lock_token: Option<String>,
    pub message_id: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl AmqpMessage {
    /// Create a message with the given body
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A device or module identity bound to one hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub host_name: String,
    pub device_id: String,
    pub module_id: Option<String>,
    pub authentication: AuthenticationModel,
    /// Policy name for grouped SAS credentials; selects the grouped pool
    pub shared_access_key_name: Option<String>,
    /// Client version string sent as a link property
    pub product_info: String,
    pub settings: AmqpTransportSettings,
}

impl DeviceIdentity {
    /// Create a device identity with default product info and no module
    pub fn new(
        host_name: impl Into<String>,
        device_id: impl Into<String>,
        authentication: AuthenticationModel,
        settings: AmqpTransportSettings,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            module_id: None,
            authentication,
            shared_access_key_name: None,
            product_info: format!("stateful-amqp/{}", env!("CARGO_PKG_VERSION")),
            settings,
        }
    }

    pub fn with_module_id(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn with_shared_access_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.shared_access_key_name = Some(key_name.into());
        self
    }

    pub fn with_product_info(mut self, product_info: impl Into<String>) -> Self {
        self.product_info = product_info.into();
        self
    }

    /// Module id, treating an empty string as absent
    pub fn module(&self) -> Option<&str> {
        self.module_id.as_deref().filter(|m| !m.trim().is_empty())
    }

    /// Whether this identity may share a pooled connection
    ///
    /// Certificate identities never share: the certificate is bound to the
    /// TLS session of one connection.
    pub fn is_pooling(&self) -> bool {
        self.authentication != AuthenticationModel::X509 && self.settings.pool.pooling
    }

    /// Base AMQP endpoint of the hub
    pub fn amqp_endpoint(&self) -> String {
        format!("amqps://{}:{}", self.host_name, AMQPS_PORT)
    }

    /// Token audience presented on the CBS link
    ///
    /// Grouped credentials authorize at hub scope; individual credentials at
    /// device or module scope.
    pub fn audience(&self) -> String {
        match (self.authentication, self.module()) {
            (AuthenticationModel::SasGrouped, _) => self.host_name.clone(),
            (_, Some(module)) => format!(
                "{}/devices/{}/modules/{}",
                self.host_name,
                urlencoding::encode(&self.device_id),
                urlencoding::encode(module)
            ),
            (_, None) => format!(
                "{}/devices/{}",
                self.host_name,
                urlencoding::encode(&self.device_id)
            ),
        }
    }

    /// Hash used to pick a pool slot
    ///
    /// Stable for the lifetime of the process for equal identities.
    pub fn pool_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.host_name.hash(&mut hasher);
        self.device_id.hash(&mut hasher);
        self.module().hash(&mut hasher);
        self.authentication.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.module() {
            Some(module) => write!(f, "{}/{}/{}", self.host_name, self.device_id, module),
            None => write!(f, "{}/{}", self.host_name, self.device_id),
        }
    }
}
