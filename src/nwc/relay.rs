//! Relay session manager backed by nostr-sdk
//!
//! One `nostr_sdk::Client` carries every relay of a connection; per-relay
//! sessions address it through targeted subscribe/send/fetch calls and the
//! pool notification stream is forwarded into the router sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::core::error::{Failure, Result};
use crate::nwc::codec::first_tag_value;
use crate::nwc::session::{
    ConnectionSnapshot, EventSink, QueryOutcome, RelaySession, RequestOutcome, RetryConfig,
    SessionEvent, SessionHandle, SessionProvider, SharedSubscription,
};

/// Session provider over a shared nostr-sdk relay pool.
pub struct RelayManager {
    client: Client,
    relays: Vec<String>,
    handles: Vec<SessionHandle>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl RelayManager {
    pub fn new(keys: Keys, relays: Vec<String>) -> Self {
        let client = Client::builder().signer(keys).build();
        let handles = relays
            .iter()
            .map(|url| SessionHandle {
                url: url.clone(),
                session: Arc::new(SdkSession {
                    url: url.clone(),
                    client: client.clone(),
                    subscriptions: Mutex::new(HashMap::new()),
                }) as Arc<dyn RelaySession>,
            })
            .collect();
        Self {
            client,
            relays,
            handles,
            forwarder: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SessionProvider for RelayManager {
    async fn open(&self, sink: EventSink) -> Result<()> {
        for url in &self.relays {
            if let Err(e) = self.client.add_relay(url.as_str()).await {
                tracing::warn!("failed to add relay {url}: {e}");
            }
        }
        self.client.connect().await;

        let mut notifications = self.client.notifications();
        let task = tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event {
                        relay_url,
                        subscription_id,
                        event,
                    }) => {
                        let forwarded = SessionEvent {
                            relay_url: relay_url.to_string(),
                            subscription_id,
                            event: *event,
                        };
                        if sink.send(forwarded).is_err() {
                            break;
                        }
                    }
                    Ok(RelayPoolNotification::Shutdown) => break,
                    // Publish acks, EOSE and other relay chatter stay in
                    // the pool; the engine only consumes events.
                    Ok(_) => {}
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("relay notification stream lagged, skipped {skipped}");
                    }
                }
            }
        });
        *self.forwarder.lock() = Some(task);

        tracing::info!("relay pool opened with {} relays", self.relays.len());
        Ok(())
    }

    fn runtime_handles(&self) -> Vec<SessionHandle> {
        self.handles.clone()
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        let output = self
            .client
            .send_event(event)
            .await
            .map_err(|e| Failure::network_caused("publish failed", e.to_string()))?;
        if output.success.is_empty() {
            return Err(Failure::network_caused(
                "event rejected by all relays",
                format!("{:?}", output.failed),
            ));
        }
        Ok(())
    }

    async fn publish_to(&self, url: &str, event: &Event) -> Result<()> {
        self.client
            .send_event_to([url], event)
            .await
            .map_err(|e| Failure::network_caused(format!("publish to {url} failed"), e.to_string()))?;
        Ok(())
    }

    async fn authenticate(&self, url: &str, _event: &Event) -> Result<()> {
        // nostr-sdk answers NIP-42 challenges itself with the pool signer.
        tracing::debug!("relay auth for {url} is handled by the pool signer");
        Ok(())
    }

    async fn ensure_relay(&self, url: &str) -> Result<()> {
        let relays = self.client.relays().await;
        let has_relay = relays.keys().any(|existing| existing.as_str() == url);
        if !has_relay {
            if let Err(err) = self.client.add_relay(url).await {
                tracing::warn!("failed to add relay {url}: {err}");
            }
        }

        if let Err(err) = self.client.connect_relay(url).await {
            tracing::warn!("failed to connect relay {url}: {err}");
        }

        Ok(())
    }

    async fn close(&self) {
        if let Some(task) = self.forwarder.lock().take() {
            task.abort();
        }
        self.client.disconnect().await;
        tracing::info!("relay pool closed");
    }
}

/// One logical session per relay, sharing the pool client.
struct SdkSession {
    url: String,
    client: Client,
    subscriptions: Mutex<HashMap<String, Vec<SubscriptionId>>>,
}

impl SdkSession {
    async fn send_with_retry(&self, event: &Event, retry: RetryConfig) -> std::result::Result<(), String> {
        match self.client.send_event_to([self.url.as_str()], event).await {
            Ok(_) => Ok(()),
            Err(err) => {
                // Write confirmation is not a separate failure mode: retry
                // the send once while the relay still reports connected.
                if retry.resend_on_failure_when_connected
                    && self.snapshot().await == ConnectionSnapshot::Connected
                {
                    tracing::debug!("resending event {} to {}", event.id, self.url);
                    self.client
                        .send_event_to([self.url.as_str()], event)
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                } else {
                    Err(err.to_string())
                }
            }
        }
    }
}

#[async_trait]
impl RelaySession for SdkSession {
    async fn subscribe(&self, id: &str, filters: Vec<Filter>) -> Result<()> {
        let mut created = Vec::with_capacity(filters.len());
        for (index, filter) in filters.into_iter().enumerate() {
            let sub_id = SubscriptionId::new(format!("{id}-{index}"));
            self.client
                .subscribe_with_id_to([self.url.as_str()], sub_id.clone(), filter, None)
                .await
                .map_err(|e| {
                    Failure::network_caused(
                        format!("subscribe on {} failed", self.url),
                        e.to_string(),
                    )
                })?;
            created.push(sub_id);
        }
        self.subscriptions.lock().insert(id.to_string(), created);
        Ok(())
    }

    async fn unsubscribe(&self, id: &str) {
        let removed = self.subscriptions.lock().remove(id);
        if let Some(sub_ids) = removed {
            for sub_id in sub_ids {
                self.client.unsubscribe(&sub_id).await;
            }
        }
    }

    async fn create_shared_subscription(
        &self,
        filter: Filter,
        timeout: Duration,
    ) -> Option<SharedSubscription> {
        let id = SubscriptionId::new(format!(
            "nwc-res-{}",
            hex::encode(rand::random::<[u8; 4]>())
        ));
        let subscribe =
            self.client
                .subscribe_with_id_to([self.url.as_str()], id.clone(), filter, None);
        match tokio::time::timeout(timeout, subscribe).await {
            Ok(Ok(_)) => Some(SharedSubscription { id }),
            Ok(Err(err)) => {
                tracing::warn!("response subscription on {} failed: {err}", self.url);
                None
            }
            Err(_) => {
                tracing::debug!("response subscription on {} timed out", self.url);
                None
            }
        }
    }

    async fn query(&self, filter: Filter, timeout: Duration, _retry: RetryConfig) -> QueryOutcome {
        match self
            .client
            .fetch_events_from([self.url.as_str()], filter, timeout)
            .await
        {
            Ok(events) => QueryOutcome::Events(events.into_iter().collect()),
            Err(err) => {
                let text = err.to_string();
                if text.to_ascii_lowercase().contains("timeout") {
                    QueryOutcome::Timeout
                } else {
                    QueryOutcome::ConnectionFailed(text)
                }
            }
        }
    }

    async fn request_one_via(
        &self,
        sub: &SharedSubscription,
        event: &Event,
        correlation_id: &EventId,
        timeout: Duration,
        retry: RetryConfig,
    ) -> RequestOutcome {
        // Subscribe to the pool stream before publishing so the response
        // cannot slip past between send and listen.
        let mut notifications = self.client.notifications();
        let deadline = tokio::time::Instant::now() + timeout;
        let correlation_hex = correlation_id.to_hex();

        if let Err(err) = self.send_with_retry(event, retry).await {
            return RequestOutcome::ConnectionFailed(err);
        }

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return RequestOutcome::Timeout;
            }
            match tokio::time::timeout(remaining, notifications.recv()).await {
                Err(_) => return RequestOutcome::Timeout,
                Ok(Err(RecvError::Closed)) => {
                    return RequestOutcome::ConnectionFailed("relay pool shut down".to_string())
                }
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Ok(RelayPoolNotification::Event {
                    subscription_id,
                    event: incoming,
                    ..
                })) => {
                    if subscription_id != sub.id {
                        continue;
                    }
                    let references_request = first_tag_value(&incoming, "e")
                        .map(|value| value == correlation_hex)
                        .unwrap_or(false);
                    if references_request {
                        return RequestOutcome::Event(incoming);
                    }
                }
                Ok(Ok(_)) => continue,
            }
        }
    }

    async fn snapshot(&self) -> ConnectionSnapshot {
        match self.client.relay(self.url.as_str()).await {
            Ok(relay) => match relay.status() {
                RelayStatus::Connected => ConnectionSnapshot::Connected,
                RelayStatus::Initialized | RelayStatus::Pending | RelayStatus::Connecting => {
                    ConnectionSnapshot::Connecting
                }
                RelayStatus::Disconnected => ConnectionSnapshot::Disconnected,
                RelayStatus::Terminated | RelayStatus::Banned => ConnectionSnapshot::Failed,
                _ => ConnectionSnapshot::Disconnected,
            },
            Err(_) => ConnectionSnapshot::Disconnected,
        }
    }
}
