//! Transport metrics definitions
//!
//! OpenTelemetry instruments for the connection core. They are exported to
//! whatever meter provider `init_observability` installed; without one they
//! are no-ops.
//!
//! # Metrics Collected
//!
//! - **transport.state**: Current transport state (gauge)
//! - **transports.created** / **transports.disposed**: Transport lifetimes (counters)
//! - **connections.established** / **connections.disconnected**: Per host (counters)
//! - **sessions.established** / **sessions.disconnected**: (counters)
//! - **reconnection.attempts** / **.success** / **.failures**: (counters)
//! - **token.refreshes** / **token.refresh_failures**: CBS token renewal (counters)
//!
//! # Examples
//!
//! ```rust,no_run
//! use stateful_amqp_client::TransportMetrics;
//!
//! let metrics = TransportMetrics::new();
//! metrics.record_connection_established("hub.example.net");
//! ```

use crate::connection_state::TransportState;
use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Meter},
    KeyValue,
};

const METER_NAME: &str = "stateful-amqp";

/// Transport metrics for monitoring
pub struct TransportMetrics {
    /// Transport state (see [`TransportState::code`])
    pub transport_state: Gauge<i64>,
    pub transports_created: Counter<u64>,
    pub transports_disposed: Counter<u64>,
    pub connections_established: Counter<u64>,
    pub connections_disconnected: Counter<u64>,
    pub sessions_established: Counter<u64>,
    pub sessions_disconnected: Counter<u64>,
    pub reconnection_attempts: Counter<u64>,
    pub reconnection_success: Counter<u64>,
    pub reconnection_failures: Counter<u64>,
    pub token_refreshes: Counter<u64>,
    pub token_refresh_failures: Counter<u64>,
}

impl TransportMetrics {
    /// Create instruments on the global meter provider
    pub fn new() -> Self {
        Self::new_with_meter(&global::meter(METER_NAME))
    }

    /// Create instruments on a custom meter
    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            transport_state: meter
                .i64_gauge("amqp.transport.state")
                .with_description("Transport state (0=disconnected, 1=connected, 2=reconnecting, 3=failed, 4=closed)")
                .build(),
            transports_created: meter
                .u64_counter("amqp.transports.created")
                .with_description("Total number of transports created")
                .build(),
            transports_disposed: meter
                .u64_counter("amqp.transports.disposed")
                .with_description("Total number of transports disposed")
                .build(),
            connections_established: meter
                .u64_counter("amqp.connections.established")
                .with_description("Total number of AMQP connections opened")
                .build(),
            connections_disconnected: meter
                .u64_counter("amqp.connections.disconnected")
                .with_description("Total number of AMQP connections that closed")
                .build(),
            sessions_established: meter
                .u64_counter("amqp.sessions.established")
                .with_description("Total number of AMQP sessions opened")
                .build(),
            sessions_disconnected: meter
                .u64_counter("amqp.sessions.disconnected")
                .with_description("Total number of AMQP sessions that closed")
                .build(),
            reconnection_attempts: meter
                .u64_counter("amqp.reconnection.attempts")
                .with_description("Total number of reconnection attempts")
                .build(),
            reconnection_success: meter
                .u64_counter("amqp.reconnection.success")
                .with_description("Total number of successful reconnections")
                .build(),
            reconnection_failures: meter
                .u64_counter("amqp.reconnection.failures")
                .with_description("Total number of reconnections abandoned")
                .build(),
            token_refreshes: meter
                .u64_counter("amqp.token.refreshes")
                .with_description("Total number of CBS tokens sent")
                .build(),
            token_refresh_failures: meter
                .u64_counter("amqp.token.refresh_failures")
                .with_description("Total number of failed CBS token exchanges")
                .build(),
        }
    }

    pub fn update_transport_state(&self, state: &TransportState) {
        self.transport_state.record(state.code(), &[]);
    }

    pub fn record_transport_created(&self) {
        self.transports_created.add(1, &[]);
    }

    pub fn record_transport_disposed(&self) {
        self.transports_disposed.add(1, &[]);
    }

    pub fn record_connection_established(&self, host: &str) {
        self.connections_established
            .add(1, &[KeyValue::new("host", host.to_string())]);
    }

    pub fn record_connection_disconnected(&self, host: &str) {
        self.connections_disconnected
            .add(1, &[KeyValue::new("host", host.to_string())]);
    }

    pub fn record_session_established(&self) {
        self.sessions_established.add(1, &[]);
    }

    pub fn record_session_disconnected(&self) {
        self.sessions_disconnected.add(1, &[]);
    }

    pub fn record_reconnection_attempt(&self) {
        self.reconnection_attempts.add(1, &[]);
    }

    pub fn record_reconnection_success(&self) {
        self.reconnection_success.add(1, &[]);
    }

    /// Record an abandoned reconnection with a short reason
    pub fn record_reconnection_failure(&self, reason: &str) {
        self.reconnection_failures
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
    }

    pub fn record_token_refresh(&self) {
        self.token_refreshes.add(1, &[]);
    }

    pub fn record_token_refresh_failure(&self) {
        self.token_refresh_failures.add(1, &[]);
    }
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = TransportMetrics::new();

        metrics.update_transport_state(&TransportState::Connected);
        metrics.record_transport_created();
        metrics.record_connection_established("hub.example.net");
        metrics.record_session_established();
        metrics.record_transport_disposed();
    }

    #[test]
    fn test_transport_state_metrics() {
        let metrics = TransportMetrics::new();

        metrics.update_transport_state(&TransportState::Disconnected);
        metrics.update_transport_state(&TransportState::Connected);
        metrics.update_transport_state(&TransportState::Reconnecting { attempt: 2 });
        metrics.update_transport_state(&TransportState::Failed);
        metrics.update_transport_state(&TransportState::Closed);
    }

    #[test]
    fn test_reconnection_and_token_metrics() {
        let metrics = TransportMetrics::new();

        metrics.record_reconnection_attempt();
        metrics.record_reconnection_attempt();
        metrics.record_reconnection_success();
        metrics.record_reconnection_failure("exhausted");

        metrics.record_token_refresh();
        metrics.record_token_refresh_failure();
        metrics.record_connection_disconnected("hub.example.net");
        metrics.record_session_disconnected();
    }
}
