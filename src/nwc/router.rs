//! Inbound event router
//!
//! Consumes the provider's event sink and dispatches by kind: responses
//! (23195) complete pending requests, notifications (23197) feed the
//! broadcast pipeline. Everything else is relay chatter and only logged.

use std::sync::Arc;

use nostr_sdk::prelude::*;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::core::error::{Failure, Result};
use crate::nwc::codec;
use crate::nwc::crypto::{self, WalletCipher};
use crate::nwc::engine::SharedState;
use crate::nwc::notifications::WalletNotification;
use crate::nwc::pending::{Completion, PendingRequests};
use crate::nwc::session::SessionEvent;
use crate::nwc::types::RawResponse;

/// Kind of NIP-47 notification events.
pub const NOTIFICATION_KIND: Kind = Kind::Custom(23197);

pub struct Router {
    wallet_pubkey: PublicKey,
    client_pubkey: PublicKey,
    cipher: WalletCipher,
    shared: Arc<SharedState>,
    pending: Arc<PendingRequests>,
    notifications_tx: broadcast::Sender<WalletNotification>,
}

impl Router {
    pub fn new(
        wallet_pubkey: PublicKey,
        client_pubkey: PublicKey,
        cipher: WalletCipher,
        shared: Arc<SharedState>,
        pending: Arc<PendingRequests>,
        notifications_tx: broadcast::Sender<WalletNotification>,
    ) -> Self {
        Self {
            wallet_pubkey,
            client_pubkey,
            cipher,
            shared,
            pending,
            notifications_tx,
        }
    }

    /// Starts the sink consumer task.
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(incoming) = rx.recv().await {
                self.dispatch(incoming);
            }
            tracing::debug!("event sink closed, router stopping");
        })
    }

    fn dispatch(&self, incoming: SessionEvent) {
        let event = incoming.event;
        if event.kind == Kind::WalletConnectResponse {
            if let Err(err) = self.handle_response(&event, None) {
                tracing::debug!("dropping response event {}: {err}", event.id);
            }
        } else if event.kind == NOTIFICATION_KIND {
            if let Err(err) = self.handle_notification(&event) {
                tracing::debug!("dropping notification event {}: {err}", event.id);
            }
        } else {
            tracing::trace!(
                "ignoring kind {} event from {}",
                event.kind,
                incoming.relay_url
            );
        }
    }

    /// The event must be authored by the wallet; when a `p` tag is present
    /// it must point at this client.
    fn authenticate_inbound(&self, event: &Event) -> Result<()> {
        if event.pubkey != self.wallet_pubkey {
            return Err(Failure::protocol("event not authored by the wallet"));
        }
        if let Some(p_tag) = codec::first_tag_value(event, "p") {
            if p_tag != self.client_pubkey.to_hex() {
                return Err(Failure::protocol("event addressed to another client"));
            }
        }
        Ok(())
    }

    /// Decrypts and parses a response event; the kind must be 23195 and the
    /// authenticity rules apply on every path, including race winners that
    /// bypass the sink.
    pub fn decode_response(&self, event: &Event) -> Result<RawResponse> {
        if event.kind != Kind::WalletConnectResponse {
            return Err(Failure::protocol(format!(
                "unexpected event kind {} in response position",
                event.kind
            )));
        }
        self.authenticate_inbound(event)?;
        let active = self.shared.active_scheme();
        let metadata = self.shared.metadata();
        let plaintext = crypto::decrypt_event(&self.cipher, event, &active, metadata.as_ref())?;
        codec::parse_response(&plaintext)
    }

    /// Routes one response event into the pending registry.
    ///
    /// Correlation id: first `e` tag, else the engine-provided override,
    /// else the registry's disambiguation heuristics. A single entry is
    /// completed directly; otherwise the per-item key (first `d` tag, else
    /// `result.payment_hash`) feeds the multi entry.
    pub fn handle_response(&self, event: &Event, override_id: Option<&str>) -> Result<()> {
        self.authenticate_inbound(event)?;
        let raw = self.decode_response(event)?;

        let correlation = codec::first_tag_value(event, "e")
            .or_else(|| override_id.map(String::from))
            .or_else(|| self.pending.resolve_request_id(&raw.result_type));
        let Some(id) = correlation else {
            tracing::debug!("response {} has no resolvable correlation id", event.id);
            return Ok(());
        };

        if self.pending.complete_single(&id, raw.clone()) == Completion::SingleCompleted {
            return Ok(());
        }

        let key = codec::first_tag_value(event, "d").or_else(|| {
            raw.result
                .as_ref()
                .and_then(|result| result.get("payment_hash"))
                .and_then(Value::as_str)
                .map(String::from)
        });
        match key {
            Some(key) => match self.pending.add_multi(&id, &key, raw) {
                Completion::MultiCompleted => {
                    tracing::debug!("multi request {id} completed");
                }
                Completion::Partial => {}
                Completion::Duplicate => {
                    tracing::debug!("duplicate multi key {key} for request {id} ignored");
                }
                Completion::NotFound => {
                    // Late response to a request that already finished.
                    tracing::debug!("no pending entry for response {}", event.id);
                }
                Completion::SingleCompleted => {}
            },
            None => {
                tracing::debug!("response {} carries no multi item key", event.id);
            }
        }
        Ok(())
    }

    /// Decodes a notification event and emits it into the broadcast
    /// channel. Unknown notification types are dropped.
    pub fn handle_notification(&self, event: &Event) -> Result<()> {
        self.authenticate_inbound(event)?;
        let active = self.shared.active_scheme();
        let metadata = self.shared.metadata();
        let plaintext = crypto::decrypt_event(&self.cipher, event, &active, metadata.as_ref())?;
        if let Some(notification) = codec::decode_notification(&plaintext)? {
            // Send fails only when nobody subscribes, which is fine.
            let _ = self.notifications_tx.send(notification);
        }
        Ok(())
    }
}
