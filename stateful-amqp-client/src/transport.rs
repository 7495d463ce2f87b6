//! AMQP device transport
//!
//! An [`AmqpTransport`] is the composition root for one device or module. It
//! owns a connection holder (its own, or a shared one from the pool), one
//! session holder on top of it and a sending plus a receiving link holder for
//! every channel. Opening the transport brings up the connection, the
//! session and the telemetry sending link; the other channels are enabled on
//! demand.
//!
//! # Reconnection
//!
//! Every session and link holder reports unexpected disconnections to the
//! transport. The first report schedules a reconnect task; reports arriving
//! while one is pending collapse into it, and a single-permit gate keeps at
//! most one reconnect loop running. The loop re-ensures every holder the
//! caller left active, sleeping between attempts as a fresh
//! [`RetryScheduler`](crate::RetryScheduler) dictates. Holders the caller
//! closed are never reopened. When a fault is not transient, or the
//! scheduler runs out of attempts, the transport reports itself
//! disconnected and stops.

use crate::connection::ConnectionHolder;
use crate::connection_state::{StateTracker, TransportState};
use crate::holder::ResourceHolder;
use crate::link::{
    ReceivingLinkAllocator, ReceivingLinkHolder, ReceivingLinkResource, SendingLinkAllocator,
    SendingLinkHolder, SendingLinkResource,
};
use crate::link_factory::LinkFactory;
use crate::link_layer::MessageListener;
use crate::metrics::TransportMetrics;
use crate::resource::{Resource, ResourceAllocator};
use crate::retry::RetrySchedulerSupplier;
use crate::session::{SessionHolder, SessionResource};
use futures::future::{join_all, try_join_all, BoxFuture};
use parking_lot::Mutex;
use stateful_amqp_core::{
    AmqpMessage, DeviceIdentity, Error, OperationStatus, Outcome, Result, Topic,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Callback for messages pushed on a channel's receiving link
pub type MessageCallback = Arc<dyn Fn(Topic, AmqpMessage) + Send + Sync + 'static>;

/// Callback fired when the transport closes or gives up reconnecting
pub type DisconnectedCallback = Arc<dyn Fn() + Send + Sync + 'static>;

struct Channel {
    sender: SendingLinkHolder,
    receiver: ReceivingLinkHolder,
}

struct Channels {
    message: Channel,
    method: Channel,
    twin: Channel,
    streams: Channel,
}

impl Channels {
    fn get(&self, topic: Topic) -> &Channel {
        match topic {
            Topic::Message => &self.message,
            Topic::Method => &self.method,
            Topic::Twin => &self.twin,
            Topic::DeviceStreaming => &self.streams,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Channel> {
        [&self.message, &self.method, &self.twin, &self.streams].into_iter()
    }
}

struct TransportInner {
    identity: DeviceIdentity,
    connection: ConnectionHolder,
    session: SessionHolder,
    channels: Channels,
    scheduler: RetrySchedulerSupplier,
    on_disconnected: DisconnectedCallback,
    state: StateTracker,
    metrics: Arc<TransportMetrics>,
    disposed: AtomicBool,
    disconnect_notified: AtomicBool,
    reconnect_pending: AtomicBool,
    reconnect_gate: Arc<Semaphore>,
    reconnect_tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    runtime: Handle,
}

/// Stateful AMQP transport for one device identity
pub struct AmqpTransport {
    inner: Arc<TransportInner>,
}

impl AmqpTransport {
    /// Wire the holder graph for `identity` on top of `connection`
    ///
    /// Must be called inside a tokio runtime; reconnect tasks are spawned on
    /// it even when a disconnection is reported from another thread.
    pub(crate) fn new(
        identity: DeviceIdentity,
        connection: ConnectionHolder,
        scheduler: RetrySchedulerSupplier,
        on_message_received: Option<MessageCallback>,
        on_disconnected: DisconnectedCallback,
        metrics: Arc<TransportMetrics>,
        link_factory: LinkFactory,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::Configuration("an AMQP transport must be created inside a tokio runtime".into())
        })?;

        let inner = Arc::new_cyclic(|weak: &Weak<TransportInner>| {
            let session_allocator: Arc<dyn ResourceAllocator<SessionResource>> =
                Arc::new(connection.clone());
            let session = SessionHolder::new(format!("session for {identity}"), session_allocator);
            watch_holder(&session, weak, "session".to_string());

            let channel = |topic: Topic| {
                build_channel(
                    &identity,
                    &session,
                    &link_factory,
                    topic,
                    on_message_received.as_ref(),
                    weak,
                )
            };
            let channels = Channels {
                message: channel(Topic::Message),
                method: channel(Topic::Method),
                twin: channel(Topic::Twin),
                streams: channel(Topic::DeviceStreaming),
            };

            TransportInner {
                identity: identity.clone(),
                connection: connection.clone(),
                session: session.clone(),
                channels,
                scheduler,
                on_disconnected,
                state: StateTracker::new(),
                metrics: Arc::clone(&metrics),
                disposed: AtomicBool::new(false),
                disconnect_notified: AtomicBool::new(false),
                reconnect_pending: AtomicBool::new(false),
                reconnect_gate: Arc::new(Semaphore::new(1)),
                reconnect_tasks: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                runtime,
            }
        });

        metrics.record_transport_created();
        tracing::debug!(device = %identity, pooled = identity.is_pooling(), "Transport created");
        Ok(Self { inner })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    /// Current connection state
    pub fn state(&self) -> TransportState {
        self.inner.state.state()
    }

    /// Receiver observing every later state change
    pub fn state_changes(&self) -> watch::Receiver<TransportState> {
        self.inner.state.subscribe()
    }

    /// Whether the transport has not been disposed
    pub fn is_usable(&self) -> bool {
        !self.inner.is_disposed()
    }

    /// Open the connection, the session and the telemetry sending link
    #[tracing::instrument(skip(self), fields(device = %self.inner.identity))]
    pub async fn open(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        inner.check_usable()?;
        let deadline = Instant::now() + timeout;
        inner.disconnect_notified.store(false, Ordering::Release);

        inner.connection.open(&inner.identity, remaining(deadline)).await?;
        inner.session.open(&inner.identity, remaining(deadline)).await?;
        inner
            .channels
            .message
            .sender
            .open(&inner.identity, remaining(deadline))
            .await?;

        inner.publish(TransportState::Connected);
        tracing::info!("Transport opened");
        Ok(())
    }

    /// Close every link, then the session, then the connection unless it is
    /// shared, and report the transport disconnected
    ///
    /// Every holder is closed even if an earlier one fails; the first error
    /// is returned.
    #[tracing::instrument(skip(self), fields(device = %self.inner.identity))]
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        inner.check_usable()?;
        let deadline = Instant::now() + timeout;

        let senders = join_all(inner.channels.iter().map(|c| c.sender.close(remaining(deadline))));
        let receivers =
            join_all(inner.channels.iter().map(|c| c.receiver.close(remaining(deadline))));
        let (senders, receivers) = futures::join!(senders, receivers);

        let mut results: Vec<Result<()>> = senders.into_iter().chain(receivers).collect();
        results.push(inner.session.close(remaining(deadline)).await);
        if !inner.identity.is_pooling() {
            results.push(inner.connection.close(remaining(deadline)).await);
        }

        inner.publish(TransportState::Closed);
        inner.notify_disconnected();
        tracing::info!("Transport closed");
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    /// Send `message` on the sending link of `topic`
    ///
    /// The channel must be enabled; the telemetry channel is enabled by
    /// `open`.
    #[tracing::instrument(skip(self, message), fields(device = %self.inner.identity, %topic))]
    pub async fn send_message(
        &self,
        topic: Topic,
        message: AmqpMessage,
        timeout: Duration,
    ) -> Result<Outcome> {
        let inner = &self.inner;
        inner.check_usable()?;
        let deadline = Instant::now() + timeout;
        let link = inner
            .channels
            .get(topic)
            .sender
            .ensure_resource(&inner.identity, remaining(deadline))
            .await?;
        let outcome = link.send(message, remaining(deadline)).await?;
        tracing::debug!(?outcome, "Message sent");
        Ok(outcome)
    }

    /// Receive the next cloud-to-device message, opening the receiving link
    /// if needed
    #[tracing::instrument(skip(self), fields(device = %self.inner.identity))]
    pub async fn receive_message(&self, timeout: Duration) -> Result<Option<AmqpMessage>> {
        let inner = &self.inner;
        inner.check_usable()?;
        let deadline = Instant::now() + timeout;
        let link = inner
            .channels
            .message
            .receiver
            .open(&inner.identity, remaining(deadline))
            .await?;
        link.receive(remaining(deadline)).await
    }

    /// Settle a received message by its lock token
    #[tracing::instrument(skip(self), fields(device = %self.inner.identity))]
    pub async fn dispose_message(
        &self,
        lock_token: &str,
        outcome: Outcome,
        timeout: Duration,
    ) -> Result<Outcome> {
        let inner = &self.inner;
        inner.check_usable()?;
        let delivery_tag = Uuid::parse_str(lock_token)
            .map_err(|e| Error::InvalidArgument(format!("invalid lock token {lock_token:?}: {e}")))?;
        let deadline = Instant::now() + timeout;
        let link = inner
            .channels
            .message
            .receiver
            .ensure_resource(&inner.identity, remaining(deadline))
            .await?;
        link.dispose_message(delivery_tag, outcome, remaining(deadline))
            .await
    }

    /// Accept a message pushed to the message callback for `topic`
    ///
    /// Returns `Ok(false)` when the channel has no live receiving link.
    pub fn dispose_delivery(&self, topic: Topic, message: &AmqpMessage) -> Result<bool> {
        self.inner.check_usable()?;
        self.inner.channels.get(topic).receiver.dispose_delivery(message)
    }

    /// Open the receiving link of the message channel
    pub async fn enable_event_receive(&self, timeout: Duration) -> Result<()> {
        self.inner.check_usable()?;
        self.inner
            .channels
            .message
            .receiver
            .open(&self.inner.identity, timeout)
            .await
            .map(|_| ())
    }

    pub async fn disable_event_receive(&self, timeout: Duration) -> Result<()> {
        self.inner.check_usable()?;
        self.inner.channels.message.receiver.close(timeout).await
    }

    /// Open both links of the direct method channel
    pub async fn enable_methods(&self, timeout: Duration) -> Result<()> {
        self.enable_channel(Topic::Method, timeout).await
    }

    pub async fn disable_methods(&self, timeout: Duration) -> Result<()> {
        self.disable_channel(Topic::Method, timeout).await
    }

    /// Open both links of the twin channel
    pub async fn enable_twin_patch(&self, timeout: Duration) -> Result<()> {
        self.enable_channel(Topic::Twin, timeout).await
    }

    pub async fn disable_twin_patch(&self, timeout: Duration) -> Result<()> {
        self.disable_channel(Topic::Twin, timeout).await
    }

    /// Open both links of the device streaming channel
    pub async fn enable_streams(&self, timeout: Duration) -> Result<()> {
        self.enable_channel(Topic::DeviceStreaming, timeout).await
    }

    pub async fn disable_streams(&self, timeout: Duration) -> Result<()> {
        self.disable_channel(Topic::DeviceStreaming, timeout).await
    }

    /// Abort every holder without waiting; the transport can be reopened
    pub fn abort(&self) {
        let inner = &self.inner;
        if inner.is_disposed() {
            return;
        }
        for channel in inner.channels.iter() {
            channel.sender.abort();
            channel.receiver.abort();
        }
        inner.session.abort();
        if !inner.identity.is_pooling() {
            inner.connection.abort();
        }
        inner.publish(TransportState::Disconnected);
        tracing::info!(device = %inner.identity, "Transport aborted");
    }

    /// Stop reconnecting, wait for the reconnect task to finish and dispose
    /// every holder this transport owns; idempotent
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.cancel.cancel();

        let tasks = std::mem::take(&mut *inner.reconnect_tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(device = %inner.identity, error = %e, "Reconnect task panicked");
                }
            }
        }

        inner.dispose_holders();
        tracing::info!(device = %inner.identity, "Transport disposed");
    }

    async fn enable_channel(&self, topic: Topic, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        inner.check_usable()?;
        let channel = inner.channels.get(topic);
        tokio::try_join!(
            channel.sender.open(&inner.identity, timeout),
            channel.receiver.open(&inner.identity, timeout),
        )?;
        tracing::debug!(device = %inner.identity, %topic, "Channel enabled");
        Ok(())
    }

    async fn disable_channel(&self, topic: Topic, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        inner.check_usable()?;
        let channel = inner.channels.get(topic);
        let (sender, receiver) = tokio::join!(channel.sender.close(timeout), channel.receiver.close(timeout));
        tracing::debug!(device = %inner.identity, %topic, "Channel disabled");
        sender.and(receiver)
    }
}

impl Drop for AmqpTransport {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        if !inner.disposed.swap(true, Ordering::AcqRel) {
            inner.dispose_holders();
        }
    }
}

impl fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("identity", &self.inner.identity.to_string())
            .field("state", &self.state())
            .finish()
    }
}

impl TransportInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed(format!("transport for {}", self.identity)));
        }
        Ok(())
    }

    fn publish(&self, state: TransportState) {
        if self.state.set(state) {
            self.metrics.update_transport_state(&state);
        }
    }

    /// Fire the disconnected callback at most once per open
    fn notify_disconnected(&self) {
        if !self.disconnect_notified.swap(true, Ordering::AcqRel) {
            (self.on_disconnected)();
        }
    }

    fn dispose_holders(&self) {
        for channel in self.channels.iter() {
            channel.sender.dispose();
            channel.receiver.dispose();
        }
        self.session.dispose();
        if !self.identity.is_pooling() {
            self.connection.dispose();
        }
        self.publish(TransportState::Closed);
        self.metrics.record_transport_disposed();
    }

    fn on_holder_disconnected(self: &Arc<Self>, origin: &str) {
        if self.is_disposed() || self.cancel.is_cancelled() {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::AcqRel) {
            tracing::debug!(device = %self.identity, origin, "Reconnect already pending");
            return;
        }

        tracing::info!(device = %self.identity, origin, "Resource disconnected, scheduling reconnect");
        let inner = Arc::clone(self);
        let task = self.runtime.spawn(async move { inner.reconnect().await });

        let mut tasks = self.reconnect_tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    async fn reconnect(self: Arc<Self>) {
        let gate = Arc::clone(&self.reconnect_gate);
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return,
            permit = gate.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        self.reconnect_pending.store(false, Ordering::Release);

        let mut scheduler = (self.scheduler)();
        let mut attempt: u32 = 0;

        while !self.is_disposed() {
            attempt = attempt.saturating_add(1);
            if self.state.reconnecting(attempt) {
                self.metrics
                    .update_transport_state(&TransportState::Reconnecting { attempt });
            }
            self.metrics.record_reconnection_attempt();

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.ensure_active_holders(scheduler.operation_timeout()) => result,
            };

            let error = match result {
                Ok(()) => {
                    if self.state.connected() {
                        self.metrics.update_transport_state(&TransportState::Connected);
                    }
                    self.metrics.record_reconnection_success();
                    tracing::info!(device = %self.identity, attempt, "Reconnected");
                    return;
                }
                Err(error) => error,
            };

            if !error.is_transient() {
                self.give_up(&error, "fatal");
                return;
            }
            if !scheduler.has_next() {
                self.give_up(&error, "exhausted");
                return;
            }
            let delay = match scheduler.next_interval() {
                Ok(delay) => delay,
                Err(exhausted) => {
                    self.give_up(&exhausted, "exhausted");
                    return;
                }
            };

            tracing::warn!(device = %self.identity, attempt, error = %error, ?delay, "Reconnect attempt failed, retrying");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Ensure the session and every link the caller left active
    async fn ensure_active_holders(&self, timeout: Duration) -> Result<()> {
        let identity = &self.identity;
        let mut pending: Vec<BoxFuture<'_, Result<()>>> = Vec::new();
        pending.push(Box::pin(ensure_if_active(&self.session, identity, timeout)));
        for channel in self.channels.iter() {
            pending.push(Box::pin(ensure_if_active(&channel.sender, identity, timeout)));
            pending.push(Box::pin(ensure_if_active(&channel.receiver, identity, timeout)));
        }
        try_join_all(pending).await.map(|_| ())
    }

    fn give_up(&self, error: &Error, reason: &str) {
        tracing::error!(device = %self.identity, error = %error, reason, "Reconnection abandoned");
        if self.state.failed() {
            self.metrics.update_transport_state(&TransportState::Failed);
        }
        self.metrics.record_reconnection_failure(reason);
        self.notify_disconnected();
    }
}

async fn ensure_if_active<T: Resource>(
    holder: &ResourceHolder<T>,
    identity: &DeviceIdentity,
    timeout: Duration,
) -> Result<()> {
    if holder.status() != OperationStatus::Active {
        return Ok(());
    }
    match holder.ensure_resource(identity, timeout).await {
        // Closed by the caller while the attempt was running
        Ok(_) | Err(Error::Inactive(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn watch_holder<T: Resource>(holder: &ResourceHolder<T>, transport: &Weak<TransportInner>, origin: String) {
    let transport = transport.clone();
    holder.subscribe(Arc::new(move || {
        if let Some(inner) = transport.upgrade() {
            inner.on_holder_disconnected(&origin);
        }
    }));
}

fn build_channel(
    identity: &DeviceIdentity,
    session: &SessionHolder,
    factory: &LinkFactory,
    topic: Topic,
    on_message_received: Option<&MessageCallback>,
    transport: &Weak<TransportInner>,
) -> Channel {
    // Devices pull cloud-to-device messages; modules get their events pushed
    let pushes = topic != Topic::Message || identity.module().is_some();
    let message_listener: Option<MessageListener> = on_message_received
        .filter(|_| pushes)
        .map(|callback| {
            let callback = Arc::clone(callback);
            Arc::new(move |message: AmqpMessage| callback(topic, message)) as MessageListener
        });

    let sender_allocator: Arc<dyn ResourceAllocator<SendingLinkResource>> = Arc::new(SendingLinkAllocator::new(
        session.clone(),
        factory.clone(),
        topic,
    ));
    let sender = SendingLinkHolder::new(format!("{topic} sending link for {identity}"), sender_allocator);
    watch_holder(&sender, transport, format!("{topic} sending link"));

    let receiver_allocator: Arc<dyn ResourceAllocator<ReceivingLinkResource>> = Arc::new(ReceivingLinkAllocator::new(
        session.clone(),
        factory.clone(),
        topic,
        message_listener,
    ));
    let receiver =
        ReceivingLinkHolder::new(format!("{topic} receiving link for {identity}"), receiver_allocator);
    watch_holder(&receiver, transport, format!("{topic} receiving link"));

    Channel { sender, receiver }
}
