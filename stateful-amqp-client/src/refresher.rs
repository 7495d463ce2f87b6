//! CBS token renewal
//!
//! An [`AuthenticationRefresher`] puts a token on a connection's CBS link once
//! when it is started, then keeps re-sending it in a background task each
//! time the previous token is due for renewal. Credentials that never expire
//! get a refresher with no task at all.
//!
//! Failures are logged and retried at the next scheduled time; the loop never
//! spins. Disposal cancels the task cooperatively, waking it if it is asleep.

use crate::link_layer::{CbsLink, RefreshOn, TokenRequest};
use crate::metrics::TransportMetrics;
use parking_lot::Mutex;
use stateful_amqp_core::{DeviceIdentity, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Claim requested for device connections
pub const DEVICE_CONNECT_CLAIM: &str = "DeviceConnect";

/// Shortest interval between two token exchanges
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Refresher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefresherStatus {
    Running,
    Canceled,
}

/// Background token renewal for one CBS link
#[derive(Debug)]
pub struct AuthenticationRefresher {
    audience: String,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AuthenticationRefresher {
    /// Send the first token and start renewing it
    ///
    /// Fails with the mapped link error if the first exchange fails; nothing
    /// is left running in that case.
    pub async fn start(
        cbs: Arc<dyn CbsLink>,
        identity: &DeviceIdentity,
        audience: String,
        timeout: Duration,
        metrics: Arc<TransportMetrics>,
    ) -> Result<Self> {
        let request = TokenRequest {
            namespace_address: identity.amqp_endpoint(),
            audience: audience.clone(),
            claims: vec![DEVICE_CONNECT_CLAIM.to_string()],
        };

        let refresh_on = cbs.send_token(&request, timeout).await.map_err(|e| {
            metrics.record_token_refresh_failure();
            Error::from(e)
        })?;
        metrics.record_token_refresh();

        let cancel = CancellationToken::new();
        let task = match refresh_on {
            RefreshOn::Never => {
                tracing::debug!(audience = %audience, "Token never expires, no refresh scheduled");
                None
            }
            RefreshOn::At(at) => {
                tracing::debug!(audience = %audience, "Token refresh scheduled");
                Some(tokio::spawn(refresh_loop(
                    cbs,
                    request,
                    at,
                    timeout,
                    cancel.clone(),
                    metrics,
                )))
            }
        };

        Ok(Self {
            audience,
            cancel,
            task: Mutex::new(task),
        })
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn status(&self) -> RefresherStatus {
        let running = self
            .task
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished());
        if running && !self.cancel.is_cancelled() {
            RefresherStatus::Running
        } else {
            RefresherStatus::Canceled
        }
    }

    /// Stop renewing; idempotent
    pub fn dispose(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(audience = %self.audience, "Token refresher disposed");
        }
        self.cancel.cancel();
        self.task.lock().take();
    }
}

impl Drop for AuthenticationRefresher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn refresh_loop(
    cbs: Arc<dyn CbsLink>,
    request: TokenRequest,
    first_refresh: Instant,
    timeout: Duration,
    cancel: CancellationToken,
    metrics: Arc<TransportMetrics>,
) {
    let mut refresh_on = first_refresh;
    let mut lifetime = first_refresh
        .saturating_duration_since(Instant::now())
        .max(MIN_REFRESH_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(refresh_on) => {}
        }

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = cbs.send_token(&request, timeout) => sent,
        };

        let now = Instant::now();
        match sent {
            Ok(RefreshOn::At(next)) => {
                metrics.record_token_refresh();
                lifetime = next.saturating_duration_since(now).max(MIN_REFRESH_INTERVAL);
                refresh_on = now + lifetime;
                tracing::debug!(audience = %request.audience, ?lifetime, "Token refreshed");
            }
            Ok(RefreshOn::Never) => {
                metrics.record_token_refresh();
                tracing::debug!(audience = %request.audience, "Token no longer expires, refresher stopping");
                break;
            }
            Err(e) => {
                metrics.record_token_refresh_failure();
                refresh_on = now + lifetime;
                tracing::warn!(audience = %request.audience, error = %e, ?lifetime, "Token refresh failed, retrying later");
            }
        }
    }
}
