//! Error types for the stateful AMQP transport
//!
//! This module provides the error taxonomy shared by every layer of the
//! transport. It defines two families of errors:
//!
//! - **Error**: The domain error surfaced to callers of holders, allocators,
//!   pools and the transport itself (uses thiserror)
//! - **LinkError**: Faults reported by the underlying link layer (connector,
//!   connection, session, link and CBS objects)
//!
//! # Transient vs. Fatal
//!
//! Every `Error` is either transient or fatal. Transient errors (timeouts,
//! flagged network faults, layer disconnections) are retried by the
//! reconnection loop; everything else ends it. The decision is made by
//! [`Error::is_transient`], never by inspecting the originating fault.
//!
//! # Reclassification
//!
//! Link-layer faults convert into domain errors with `From<LinkError>`. When
//! an open call fails because its parent object has gone away underneath it,
//! allocators use [`LinkError::classify`] so the caller sees "the session is
//! disconnected" rather than a generic invalid-operation fault.
//!
//! # Examples
//!
//! ```rust
//! use stateful_amqp_core::{Error, Layer, LinkError};
//!
//! let fault = LinkError::invalid_operation("session is closing");
//!
//! // Parent still valid: the fault is reported as is
//! let err = fault.clone().classify(Layer::Session, true);
//! assert!(matches!(err, Error::InvalidOperation(_)));
//!
//! // Parent gone: the layer's disconnection is reported instead
//! let err = fault.classify(Layer::Session, false);
//! assert!(matches!(err, Error::Disconnected(Layer::Session)));
//! assert!(err.is_transient());
//! ```

use std::fmt;
use thiserror::Error;

/// Result type for transport operations
///
/// This is a convenience type alias that uses the transport `Error` type.
/// Used throughout the stateful-amqp crates for consistent error handling.
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol layer a resource belongs to
///
/// Used to name which layer went away when a fault is reclassified as a
/// disconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    /// Network-level AMQP connection
    Connection,
    /// Session multiplexed on a connection
    Session,
    /// Sending or receiving link on a session
    Link,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Connection => f.write_str("connection"),
            Layer::Session => f.write_str("session"),
            Layer::Link => f.write_str("link"),
        }
    }
}

/// Domain error type for transport operations
///
/// This enum represents every failure a caller of the transport core can
/// observe. Link-layer faults are mapped into it; nothing is swallowed.
///
/// # Error Categories
///
/// - **Lifecycle errors**: Disposed, Inactive
/// - **Retryable errors**: Timeout, TransientCommunication, Disconnected
/// - **Fatal errors**: NonTransientCommunication, Unauthorized, DeviceNotFound
/// - **Policy errors**: RetryExhausted
/// - **Usage errors**: InvalidOperation, InvalidArgument, Configuration
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The holder or resource was disposed and can no longer be used
    ///
    /// Fatal to the current attempt, not to the process.
    #[error("{0} has been disposed")]
    Disposed(String),

    /// The holder was closed and must be re-opened before use
    #[error("{0} is not open")]
    Inactive(String),

    /// A gate or network deadline elapsed
    ///
    /// Always transient: the caller (or the reconnection loop) may retry.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A network or protocol fault flagged as retryable
    #[error("Transient communication error: {0}")]
    TransientCommunication(String),

    /// A network or protocol fault that retrying will not fix
    #[error("Communication error: {0}")]
    NonTransientCommunication(String),

    /// The retry scheduler has no attempts left
    #[error("Retry attempts exhausted after {attempts} attempts")]
    RetryExhausted {
        /// Number of intervals handed out before exhaustion
        attempts: u32,
    },

    /// The given protocol layer went away underneath the operation
    ///
    /// Substituted for invalid-operation faults when the parent object is no
    /// longer valid, so callers get a consistent signal.
    #[error("AMQP {0} is disconnected")]
    Disconnected(Layer),

    /// The operation is not valid in the current state of the target
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The service rejected the presented credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The addressed device or module does not exist
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A caller-supplied argument was malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Settings could not be parsed or are inconsistent
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether the reconnection loop (or a caller) should retry after this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::TransientCommunication(_) | Error::Disconnected(_)
        )
    }
}

/// Category of a link-layer fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkErrorKind {
    /// The link-layer call did not complete in time
    #[error("timeout")]
    Timeout,
    /// The link-layer call was canceled, usually because its object closed
    #[error("canceled")]
    Canceled,
    /// Socket or TLS failure
    #[error("io")]
    Io,
    /// AMQP error condition returned by the peer
    #[error("protocol")]
    Protocol {
        /// Whether the condition is worth retrying
        transient: bool,
    },
    /// Token or certificate rejected
    #[error("unauthorized")]
    Unauthorized,
    /// Entity (device, module, node) not found
    #[error("not found")]
    NotFound,
    /// The object is in a state that does not allow the call
    #[error("invalid operation")]
    InvalidOperation,
}

/// A fault reported by the link layer
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct LinkError {
    /// Fault category
    pub kind: LinkErrorKind,
    /// Human-readable detail from the link layer
    pub message: String,
}

impl LinkError {
    /// Create a link error of the given kind
    pub fn new(kind: LinkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Timeout, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Canceled, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Io, message)
    }

    /// Protocol fault with an explicit transient flag
    pub fn protocol(transient: bool, message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Protocol { transient }, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::NotFound, message)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::InvalidOperation, message)
    }

    /// Map this fault for an open call made on a parent of the given layer
    ///
    /// Invalid-operation and canceled faults raised while the parent is no
    /// longer valid become `Error::Disconnected(layer)`. Every other fault goes
    /// through the regular `From<LinkError>` mapping.
    pub fn classify(self, layer: Layer, parent_valid: bool) -> Error {
        match self.kind {
            LinkErrorKind::InvalidOperation | LinkErrorKind::Canceled if !parent_valid => {
                Error::Disconnected(layer)
            }
            _ => self.into(),
        }
    }
}

impl From<LinkError> for Error {
    fn from(err: LinkError) -> Self {
        match err.kind {
            LinkErrorKind::Timeout => Error::Timeout(err.message),
            LinkErrorKind::Canceled | LinkErrorKind::Io => {
                Error::TransientCommunication(err.message)
            }
            LinkErrorKind::Protocol { transient: true } => {
                Error::TransientCommunication(err.message)
            }
            LinkErrorKind::Protocol { transient: false } => {
                Error::NonTransientCommunication(err.message)
            }
            LinkErrorKind::Unauthorized => Error::Unauthorized(err.message),
            LinkErrorKind::NotFound => Error::DeviceNotFound(err.message),
            LinkErrorKind::InvalidOperation => Error::InvalidOperation(err.message),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout("gate".into()).is_transient());
        assert!(Error::TransientCommunication("reset".into()).is_transient());
        assert!(Error::Disconnected(Layer::Connection).is_transient());

        assert!(!Error::Disposed("holder".into()).is_transient());
        assert!(!Error::Inactive("holder".into()).is_transient());
        assert!(!Error::NonTransientCommunication("bad frame".into()).is_transient());
        assert!(!Error::RetryExhausted { attempts: 3 }.is_transient());
        assert!(!Error::Unauthorized("expired".into()).is_transient());
    }

    #[test]
    fn test_link_error_mapping() {
        let mapped: Error = LinkError::timeout("open").into();
        assert!(matches!(mapped, Error::Timeout(_)));

        let mapped: Error = LinkError::io("connection reset").into();
        assert!(matches!(mapped, Error::TransientCommunication(_)));

        let mapped: Error = LinkError::protocol(true, "server busy").into();
        assert!(matches!(mapped, Error::TransientCommunication(_)));

        let mapped: Error = LinkError::protocol(false, "decode error").into();
        assert!(matches!(mapped, Error::NonTransientCommunication(_)));

        let mapped: Error = LinkError::unauthorized("bad token").into();
        assert!(matches!(mapped, Error::Unauthorized(_)));

        let mapped: Error = LinkError::not_found("device").into();
        assert!(matches!(mapped, Error::DeviceNotFound(_)));
    }

    #[test]
    fn test_classify_with_valid_parent() {
        let err = LinkError::invalid_operation("closing").classify(Layer::Connection, true);
        match err {
            Error::InvalidOperation(msg) => assert_eq!(msg, "closing"),
            other => panic!("Expected InvalidOperation, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_with_invalid_parent() {
        let err = LinkError::canceled("aborted").classify(Layer::Session, false);
        assert!(matches!(err, Error::Disconnected(Layer::Session)));

        // Other kinds keep their own mapping even when the parent is gone
        let err = LinkError::unauthorized("nope").classify(Layer::Session, false);
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn test_error_display_formatting() {
        let error = Error::Disconnected(Layer::Session);
        assert_eq!(format!("{}", error), "AMQP session is disconnected");

        let error = Error::RetryExhausted { attempts: 5 };
        assert!(format!("{}", error).contains('5'));

        let error = LinkError::protocol(false, "amqp:decode-error");
        assert_eq!(format!("{}", error), "protocol: amqp:decode-error");
    }

    #[test]
    fn test_serde_error_is_configuration() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: Error = parse.into();
        assert!(matches!(error, Error::Configuration(_)));
    }
}
