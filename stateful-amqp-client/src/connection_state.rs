//! Transport connection state
//!
//! Tracks the transport's lifecycle as seen from the device client and
//! publishes every change on a `tokio::sync::watch` channel, so callers can
//! await a state instead of polling.
//!
//! # States
//!
//! - **Disconnected**: Initial state, nothing opened yet
//! - **Connected**: Connection, session and the message sending link are up
//! - **Reconnecting**: A sub-resource dropped; restoring it
//! - **Failed**: Reconnection gave up, the transport is no longer usable
//! - **Closed**: Closed or disposed by the caller
//!
//! # State Transitions
//!
//! ```text
//! Disconnected → Connected ⇄ Reconnecting
//!       ↑            ↓             ↓
//!       └──────── Closed        Failed
//! ```

use tokio::sync::watch;

/// Transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Not opened
    Disconnected,
    /// Open and operational
    Connected,
    /// Restoring sub-resources after a disconnection
    Reconnecting { attempt: u32 },
    /// Gave up reconnecting
    Failed,
    /// Closed by the caller
    Closed,
}

impl TransportState {
    /// Numeric code exported on the state gauge
    pub fn code(&self) -> i64 {
        match self {
            TransportState::Disconnected => 0,
            TransportState::Connected => 1,
            TransportState::Reconnecting { .. } => 2,
            TransportState::Failed => 3,
            TransportState::Closed => 4,
        }
    }

    /// Whether no reconnection will happen from this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

/// Owner side of the transport state channel
#[derive(Debug)]
pub struct StateTracker {
    sender: watch::Sender<TransportState>,
}

impl StateTracker {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(TransportState::Disconnected);
        Self { sender }
    }

    pub fn state(&self) -> TransportState {
        *self.sender.borrow()
    }

    /// New receiver observing every later change
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.sender.subscribe()
    }

    /// Publish `state`; returns false if it was already current
    pub fn set(&self, state: TransportState) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?state, "Transport state changed");
            *current = state;
            true
        })
    }

    /// Move to `Reconnecting` with the given attempt unless already terminal
    pub fn reconnecting(&self, attempt: u32) -> bool {
        self.transition_unless_terminal(TransportState::Reconnecting { attempt })
    }

    /// Move to `Connected` unless already terminal
    pub fn connected(&self) -> bool {
        self.transition_unless_terminal(TransportState::Connected)
    }

    /// Move to `Failed` unless already closed
    pub fn failed(&self) -> bool {
        self.sender.send_if_modified(|current| {
            if matches!(current, TransportState::Closed | TransportState::Failed) {
                return false;
            }
            *current = TransportState::Failed;
            true
        })
    }

    fn transition_unless_terminal(&self, state: TransportState) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                return false;
            }
            *current = state;
            true
        })
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transport_state_transitions() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.state(), TransportState::Disconnected);

        assert!(tracker.connected());
        assert_eq!(tracker.state(), TransportState::Connected);

        assert!(tracker.reconnecting(1));
        assert!(tracker.reconnecting(2));
        assert_eq!(tracker.state(), TransportState::Reconnecting { attempt: 2 });

        assert!(tracker.connected());
        assert!(!tracker.connected());

        assert!(tracker.set(TransportState::Closed));
        assert_eq!(tracker.state(), TransportState::Closed);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let tracker = StateTracker::new();
        tracker.connected();
        assert!(tracker.failed());

        assert!(!tracker.connected());
        assert!(!tracker.reconnecting(3));
        assert_eq!(tracker.state(), TransportState::Failed);

        tracker.set(TransportState::Closed);
        assert!(!tracker.failed());
        assert_eq!(tracker.state(), TransportState::Closed);
    }

    #[test]
    fn test_codes_are_distinct() {
        let codes = [
            TransportState::Disconnected.code(),
            TransportState::Connected.code(),
            TransportState::Reconnecting { attempt: 0 }.code(),
            TransportState::Failed.code(),
            TransportState::Closed.code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[tokio::test]
    async fn test_subscribers_observe_changes() {
        let tracker = StateTracker::new();
        let mut rx = tracker.subscribe();

        tracker.connected();
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow_and_update(), TransportState::Connected);

        tracker.failed();
        let state = tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.is_terminal()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*state, TransportState::Failed);
    }
}
