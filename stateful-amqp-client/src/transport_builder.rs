//! Transport builder
//!
//! The `TransportBuilder` provides a fluent API for configuring a transport
//! before it is created. It allows you to:
//! - Share a connection pool between transports, or bring a connector
//! - Replace the reconnection policy
//! - Register the message and disconnection callbacks
//! - Configure observability (OpenTelemetry)
//!
//! # Examples
//!
//! ```rust,no_run
//! use stateful_amqp_client::{AmqpConnector, FixedRate, TransportBuilder};
//! use stateful_amqp_core::{AmqpTransportSettings, AuthenticationModel, DeviceIdentity};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(connector: Arc<dyn AmqpConnector>) -> stateful_amqp_core::Result<()> {
//! let identity = DeviceIdentity::new(
//!     "hub.example.net",
//!     "thermostat-7",
//!     AuthenticationModel::SasIndividual,
//!     AmqpTransportSettings::default(),
//! );
//!
//! let transport = TransportBuilder::new(identity)
//!     .with_connector(connector)
//!     .with_retry(|| FixedRate::new(Duration::from_secs(2), 5))
//!     .on_disconnected(|| println!("device went offline"))
//!     .build()?;
//!
//! transport.open(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

use crate::link_factory::LinkFactory;
use crate::link_layer::AmqpConnector;
use crate::metrics::TransportMetrics;
use crate::pool::ConnectionPoolManager;
use crate::retry::{ExponentialBackoff, RetryScheduler, RetrySchedulerSupplier};
use crate::transport::{AmqpTransport, DisconnectedCallback, MessageCallback};
use stateful_amqp_core::{AmqpMessage, DeviceIdentity, Error, ObservabilityConfig, Result, Topic};
use std::sync::Arc;
use uuid::Uuid;

/// Builder for configuring and creating an [`AmqpTransport`]
pub struct TransportBuilder {
    identity: DeviceIdentity,
    pool: Option<Arc<ConnectionPoolManager>>,
    connector: Option<Arc<dyn AmqpConnector>>,
    scheduler: Option<RetrySchedulerSupplier>,
    on_message_received: Option<MessageCallback>,
    on_disconnected: Option<DisconnectedCallback>,
    observability_config: Option<ObservabilityConfig>,
    service_name: Option<String>,
    metrics: Option<Arc<TransportMetrics>>,
    correlation_id: Option<Uuid>,
}

impl TransportBuilder {
    /// Create a new transport builder for `identity`
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            pool: None,
            connector: None,
            scheduler: None,
            on_message_received: None,
            on_disconnected: None,
            observability_config: None,
            service_name: None,
            metrics: None,
            correlation_id: None,
        }
    }

    /// Take connection holders from a shared pool
    pub fn with_pool(mut self, pool: Arc<ConnectionPoolManager>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Open connections through `connector` with a pool of this transport's own
    ///
    /// Ignored when a shared pool is set.
    pub fn with_connector(mut self, connector: Arc<dyn AmqpConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Reconnect with schedulers produced by `supplier`
    pub fn with_retry_scheduler(mut self, supplier: RetrySchedulerSupplier) -> Self {
        self.scheduler = Some(supplier);
        self
    }

    /// Reconnect with a fresh scheduler built by `factory` for every episode
    pub fn with_retry<S, F>(self, factory: F) -> Self
    where
        S: RetryScheduler + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.with_retry_scheduler(Arc::new(move || Box::new(factory()) as Box<dyn RetryScheduler>))
    }

    /// Reconnect with the default exponential backoff (default)
    pub fn with_default_retry(mut self) -> Self {
        self.scheduler = None;
        self
    }

    /// Receive messages pushed on method, twin, stream and module event links
    pub fn on_message_received<F>(mut self, callback: F) -> Self
    where
        F: Fn(Topic, AmqpMessage) + Send + Sync + 'static,
    {
        self.on_message_received = Some(Arc::new(callback));
        self
    }

    /// Be told when the transport closes or stops reconnecting
    pub fn on_disconnected<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_disconnected = Some(Arc::new(callback));
        self
    }

    /// Enable OpenTelemetry observability with custom configuration
    pub fn with_observability(mut self, config: ObservabilityConfig) -> Self {
        self.observability_config = Some(config);
        self
    }

    /// Enable OpenTelemetry observability with default configuration
    pub fn with_default_observability(mut self) -> Self {
        self.observability_config = Some(ObservabilityConfig::default());
        self
    }

    /// Set service name for observability (used if observability is enabled)
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Record into existing metric instruments
    pub fn with_metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fix the channel correlation id instead of generating one
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Validate the settings and create the transport
    ///
    /// Must be called inside a tokio runtime. Nothing is opened yet.
    pub fn build(self) -> Result<AmqpTransport> {
        self.identity.settings.validate()?;

        if let Some(mut config) = self.observability_config {
            if let Some(name) = self.service_name {
                config.service_name = name;
            }
            stateful_amqp_core::init_observability(config).map_err(|e| {
                Error::Configuration(format!("Failed to initialize observability: {}", e))
            })?;
        }

        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(TransportMetrics::new()));

        let pool = match (self.pool, self.connector) {
            (Some(pool), _) => pool,
            (None, Some(connector)) => {
                Arc::new(ConnectionPoolManager::new(connector, Arc::clone(&metrics)))
            }
            (None, None) => {
                return Err(Error::Configuration(
                    "a connection pool or a connector is required".into(),
                ))
            }
        };
        let connection = pool.allocate_holder(&self.identity);

        let operation_timeout = self.identity.settings.operation_timeout;
        let scheduler = self.scheduler.unwrap_or_else(|| {
            Arc::new(move || {
                Box::new(ExponentialBackoff::for_reconnect(operation_timeout)) as Box<dyn RetryScheduler>
            }) as RetrySchedulerSupplier
        });
        let on_disconnected = self
            .on_disconnected
            .unwrap_or_else(|| Arc::new(|| {}) as DisconnectedCallback);
        let link_factory = self
            .correlation_id
            .map_or_else(LinkFactory::new, LinkFactory::with_correlation_id);

        AmqpTransport::new(
            self.identity,
            connection,
            scheduler,
            self.on_message_received,
            on_disconnected,
            metrics,
            link_factory,
        )
    }
}
