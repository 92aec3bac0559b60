//! Relay session contract consumed by the request engine
//!
//! The engine only talks to relays through these traits, so the transport
//! can be swapped for a scripted fake in tests. `relay::RelayManager` is the
//! nostr-sdk backed implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tokio::sync::mpsc;

use crate::core::error::Result;

/// Connection snapshot for a single relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSnapshot {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

/// Aggregate connection state across all relays of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Every relay is connected.
    Ready,
    /// At least one relay is connected.
    Degraded,
    Connecting,
    Disconnected,
    Failed,
}

/// Folds per-relay snapshots into one aggregate state. Any connected relay
/// keeps the client usable; with none connected a failed relay outweighs
/// one that is still connecting.
pub fn aggregate(snapshots: &[ConnectionSnapshot]) -> ConnectionState {
    if snapshots.is_empty() {
        return ConnectionState::Disconnected;
    }
    let connected = snapshots
        .iter()
        .filter(|snapshot| matches!(snapshot, ConnectionSnapshot::Connected))
        .count();
    if connected == snapshots.len() {
        return ConnectionState::Ready;
    }
    if connected > 0 {
        return ConnectionState::Degraded;
    }
    if snapshots
        .iter()
        .any(|snapshot| matches!(snapshot, ConnectionSnapshot::Failed))
    {
        return ConnectionState::Failed;
    }
    if snapshots
        .iter()
        .any(|snapshot| matches!(snapshot, ConnectionSnapshot::Connecting))
    {
        return ConnectionState::Connecting;
    }
    ConnectionState::Disconnected
}

/// Retry policy for a single relay interaction. Deliberately minimal: one
/// resend after a failed write while the relay reports itself connected,
/// and never a pre-request network check.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub resend_on_failure_when_connected: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            resend_on_failure_when_connected: true,
        }
    }
}

/// Outcome of a stored-events query.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Events(Vec<Event>),
    Timeout,
    ConnectionFailed(String),
}

/// Outcome of a publish-and-await-response exchange.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Event(Box<Event>),
    Timeout,
    ConnectionFailed(String),
}

/// Handle to a long-lived subscription shared by all requests on a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedSubscription {
    pub id: SubscriptionId,
}

/// An inbound event forwarded from a relay session into the router sink.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub relay_url: String,
    pub subscription_id: SubscriptionId,
    pub event: Event,
}

pub type EventSink = mpsc::UnboundedSender<SessionEvent>;

/// One logical session per relay.
#[async_trait]
pub trait RelaySession: Send + Sync {
    /// Installs the filters under a logical subscription id.
    async fn subscribe(&self, id: &str, filters: Vec<Filter>) -> Result<()>;

    async fn unsubscribe(&self, id: &str);

    /// Creates the long-lived subscription used to receive responses.
    /// `None` when the relay did not confirm within `timeout`.
    async fn create_shared_subscription(
        &self,
        filter: Filter,
        timeout: Duration,
    ) -> Option<SharedSubscription>;

    /// Fetches stored events matching `filter`.
    async fn query(&self, filter: Filter, timeout: Duration, retry: RetryConfig) -> QueryOutcome;

    /// Publishes `event` to this relay and waits for the event matching
    /// `correlation_id` to arrive on `sub`. At most one event is returned.
    async fn request_one_via(
        &self,
        sub: &SharedSubscription,
        event: &Event,
        correlation_id: &EventId,
        timeout: Duration,
        retry: RetryConfig,
    ) -> RequestOutcome;

    async fn snapshot(&self) -> ConnectionSnapshot;
}

/// A per-relay session handle exposed by the provider, keyed by relay URL.
#[derive(Clone)]
pub struct SessionHandle {
    pub url: String,
    pub session: Arc<dyn RelaySession>,
}

/// The runtime contract the client consumes. Sessions are owned by the
/// provider; the client only holds handles keyed by relay URL.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Connects every relay and begins forwarding inbound events into
    /// `sink`.
    async fn open(&self, sink: EventSink) -> Result<()>;

    fn runtime_handles(&self) -> Vec<SessionHandle>;

    /// Publishes to all relays; succeeds when any relay accepts the event.
    async fn publish(&self, event: &Event) -> Result<()>;

    async fn publish_to(&self, url: &str, event: &Event) -> Result<()>;

    /// Relay auth pass-through (NIP-42); the engine never initiates it.
    async fn authenticate(&self, url: &str, event: &Event) -> Result<()>;

    /// Re-adds and reconnects a relay that dropped out of the runtime.
    async fn ensure_relay(&self, url: &str) -> Result<()>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    use ConnectionSnapshot::*;

    #[test]
    fn aggregate_ready_when_all_connected() {
        assert_eq!(aggregate(&[Connected, Connected]), ConnectionState::Ready);
    }

    #[test]
    fn aggregate_degraded_when_partially_connected() {
        assert_eq!(
            aggregate(&[Connected, Disconnected]),
            ConnectionState::Degraded
        );
    }

    #[test]
    fn aggregate_failed_outweighs_connecting() {
        assert_eq!(aggregate(&[Failed, Connecting]), ConnectionState::Failed);
    }

    #[test]
    fn aggregate_connecting_without_failures() {
        assert_eq!(
            aggregate(&[Connecting, Disconnected]),
            ConnectionState::Connecting
        );
    }

    #[test]
    fn aggregate_empty_is_disconnected() {
        assert_eq!(aggregate(&[]), ConnectionState::Disconnected);
    }
}
