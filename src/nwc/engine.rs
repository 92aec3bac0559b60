//! Request engine
//!
//! Builds encrypted kind 23194 request events, races every ready relay for
//! the response, and correlates single and multi results through the
//! pending registry. The correlation id of a request is its signed event id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use nostr_sdk::prelude::*;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::core::config::ClientConfig;
use crate::core::error::{Failure, NwcError, Result};
use crate::nwc::codec;
use crate::nwc::crypto::{EncryptionScheme, WalletCipher, ENCRYPTION_TAG};
use crate::nwc::init::{Initializer, ReadyRelay};
use crate::nwc::pending::{Pending, PendingRequests};
use crate::nwc::router::{Router, NOTIFICATION_KIND};
use crate::nwc::session::{QueryOutcome, RequestOutcome, RetryConfig};
use crate::nwc::types::{GetInfoResult, Method, RawResponse, WalletMetadata};

/// Wallet knowledge shared between the engine, router and façade: the
/// active encryption scheme plus the latest metadata and info results.
/// Single writer (metadata refresh), many readers.
pub struct SharedState {
    active_scheme: RwLock<EncryptionScheme>,
    metadata: RwLock<Option<WalletMetadata>>,
    info: RwLock<Option<GetInfoResult>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    /// Until the wallet advertises anything better the NIP-47 default of
    /// NIP-04 applies.
    pub fn new() -> Self {
        Self {
            active_scheme: RwLock::new(EncryptionScheme::Nip04),
            metadata: RwLock::new(None),
            info: RwLock::new(None),
        }
    }

    pub fn active_scheme(&self) -> EncryptionScheme {
        self.active_scheme.read().clone()
    }

    pub fn set_active_scheme(&self, scheme: EncryptionScheme) {
        *self.active_scheme.write() = scheme;
    }

    pub fn metadata(&self) -> Option<WalletMetadata> {
        self.metadata.read().clone()
    }

    pub fn set_metadata(&self, metadata: WalletMetadata) {
        *self.metadata.write() = Some(metadata);
    }

    pub fn info(&self) -> Option<GetInfoResult> {
        self.info.read().clone()
    }

    pub fn set_info(&self, info: GetInfoResult) {
        *self.info.write() = Some(info);
    }
}

/// Filter for the shared response subscription: responses the wallet
/// addresses to this client.
pub fn response_filter(wallet_pubkey: PublicKey, client_pubkey: PublicKey) -> Filter {
    Filter::new()
        .kind(Kind::WalletConnectResponse)
        .author(wallet_pubkey)
        .custom_tag(
            SingleLetterTag::lowercase(Alphabet::P),
            client_pubkey.to_hex(),
        )
}

/// Notification filters. Both variants are installed: the strict one with
/// the `p` tag, and a permissive one without it for wallets that omit the
/// tag on notifications.
pub fn notification_filters(wallet_pubkey: PublicKey, client_pubkey: PublicKey) -> Vec<Filter> {
    vec![
        Filter::new()
            .kind(NOTIFICATION_KIND)
            .author(wallet_pubkey)
            .custom_tag(
                SingleLetterTag::lowercase(Alphabet::P),
                client_pubkey.to_hex(),
            ),
        Filter::new().kind(NOTIFICATION_KIND).author(wallet_pubkey),
    ]
}

/// Filter for the kind 13194 wallet info event.
pub fn info_filter(wallet_pubkey: PublicKey) -> Filter {
    Filter::new()
        .kind(Kind::WalletConnectInfo)
        .author(wallet_pubkey)
        .limit(1)
}

/// Builds and signs a request event: encrypted `{method, params}` body,
/// `p` tag pointing at the wallet, `encryption` tag naming the scheme the
/// content was actually encrypted with, optional `expiration` tag.
pub(crate) fn build_request_event(
    keys: &Keys,
    wallet_pubkey: PublicKey,
    cipher: &WalletCipher,
    scheme: &EncryptionScheme,
    expiry: Option<Duration>,
    method: Method,
    params: &Value,
) -> Result<Event> {
    let plaintext = codec::serialize_request(method, params);
    let ciphertext = cipher.encrypt(&plaintext, scheme)?;

    let mut tags = vec![
        Tag::public_key(wallet_pubkey),
        Tag::custom(TagKind::custom(ENCRYPTION_TAG), [scheme.as_str()]),
    ];
    if let Some(expiry) = expiry {
        tags.push(Tag::expiration(Timestamp::now() + expiry));
    }

    EventBuilder::new(Kind::WalletConnectRequest, ciphertext)
        .tags(tags)
        .sign_with_keys(keys)
        .map_err(|e| Failure::unknown_caused("failed to sign request event", e.to_string()))
}

/// A signed request event ready for dispatch.
pub struct Prepared {
    pub method: Method,
    pub event: Event,
}

pub struct RequestEngine {
    keys: Keys,
    wallet_pubkey: PublicKey,
    cipher: WalletCipher,
    shared: Arc<SharedState>,
    pending: Arc<PendingRequests>,
    init: Arc<Initializer>,
    router: Arc<Router>,
    config: ClientConfig,
}

impl RequestEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keys: Keys,
        wallet_pubkey: PublicKey,
        cipher: WalletCipher,
        shared: Arc<SharedState>,
        pending: Arc<PendingRequests>,
        init: Arc<Initializer>,
        router: Arc<Router>,
        config: ClientConfig,
    ) -> Self {
        Self {
            keys,
            wallet_pubkey,
            cipher,
            shared,
            pending,
            init,
            router,
            config,
        }
    }

    /// Builds the signed request event with the currently active scheme.
    pub fn prepare(&self, method: Method, params: &Value) -> Result<Prepared> {
        let scheme = self.shared.active_scheme();
        let event = build_request_event(
            &self.keys,
            self.wallet_pubkey,
            &self.cipher,
            &scheme,
            self.config.request_expiry,
            method,
            params,
        )?;
        Ok(Prepared { method, event })
    }

    /// Single-request path: dispatch, await the correlated response, unwrap
    /// the wallet result. A wallet error envelope surfaces as
    /// `Failure::Wallet`.
    pub async fn execute_single(&self, prepared: Prepared, deadline: Duration) -> Result<Value> {
        let raw = self.exchange(prepared, deadline).await?;
        if let Some(error) = raw.error {
            return Err(Failure::Wallet(error));
        }
        raw.result
            .ok_or_else(|| Failure::protocol("response carried neither result nor error"))
    }

    async fn exchange(&self, prepared: Prepared, deadline: Duration) -> Result<RawResponse> {
        let started = tokio::time::Instant::now();
        let relays = self.init.await_ready(deadline).await?;
        if relays.is_empty() {
            return Err(Failure::network("no response subscriptions available"));
        }
        // Readiness consumed part of the end-to-end deadline.
        let deadline = remaining(deadline, started)?;

        let Prepared { method, event } = prepared;
        let correlation = event.id;
        let id = correlation.to_hex();
        let (tx, rx) = oneshot::channel();
        self.pending.register(&id, Pending::Single { method, tx })?;
        tracing::debug!(
            "dispatching {method} request {id} across {} relays",
            relays.len()
        );

        let outcome = tokio::time::timeout(deadline, async {
            tokio::select! {
                raced = race(&relays, &event, &correlation, deadline) => match raced {
                    RequestOutcome::Event(response) => {
                        self.pending.remove(&id);
                        self.router.decode_response(&response)
                    }
                    RequestOutcome::Timeout => Err(Failure::timeout(format!(
                        "no response to {method} within {deadline:?}"
                    ))),
                    RequestOutcome::ConnectionFailed(err) => {
                        Err(Failure::network_caused("all relays failed", err))
                    }
                },
                // The response may instead arrive through the shared
                // subscription and complete the registry entry first.
                routed = rx => routed.map_err(|_| Failure::network("request cancelled")),
            }
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(Failure::timeout(format!(
                "{method} timed out after {deadline:?}"
            ))),
        };
        // Drop the entry in every exit path; late responses to a finished
        // request then miss the registry and are silently discarded.
        self.pending.remove(&id);
        result
    }

    /// Multi-request path: one request event carrying the item list, one
    /// Multi registry entry keyed by item ids. The race captures the first
    /// response; the rest arrive through the shared subscription.
    pub async fn execute_multi(
        &self,
        prepared: Prepared,
        expected: Vec<String>,
        deadline: Duration,
    ) -> Result<HashMap<String, RawResponse>> {
        let started = tokio::time::Instant::now();
        let relays = self.init.await_ready(deadline).await?;
        if relays.is_empty() {
            return Err(Failure::network("no response subscriptions available"));
        }
        let deadline = remaining(deadline, started)?;

        let Prepared { method, event } = prepared;
        let correlation = event.id;
        let id = correlation.to_hex();
        let (tx, rx) = oneshot::channel();
        self.pending.register(
            &id,
            Pending::Multi {
                method,
                expected: expected.into_iter().collect(),
                results: HashMap::new(),
                tx,
            },
        )?;
        tracing::debug!("dispatching {method} request {id}");

        let seed = async {
            match race(&relays, &event, &correlation, deadline).await {
                RequestOutcome::Event(first) => {
                    if let Err(err) = self.router.handle_response(&first, Some(&id)) {
                        tracing::debug!("failed to process first multi response: {err}");
                    }
                }
                RequestOutcome::Timeout => {
                    tracing::debug!("no direct response to multi request {id}");
                }
                RequestOutcome::ConnectionFailed(err) => {
                    // Every relay failed: fan the error out to each item so
                    // the awaiter resolves before the deadline.
                    tracing::debug!("multi request {id} dispatch failed: {err}");
                    self.pending
                        .complete_with_error(&id, NwcError::new("INTERNAL", err));
                }
            }
            // Completion otherwise comes exclusively from the registry.
            std::future::pending::<()>().await
        };

        let outcome = tokio::time::timeout(deadline, async {
            tokio::pin!(seed);
            tokio::select! {
                results = rx => results.map_err(|_| Failure::network("request cancelled")),
                _ = &mut seed => unreachable!("seed future never resolves"),
            }
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(Failure::timeout(format!(
                "{method} timed out after {deadline:?}"
            ))),
        };
        self.pending.remove(&id);
        result
    }

    /// Fans a kind 13194 query out to every ready relay; the first relay
    /// returning an event wins and the remaining queries are dropped.
    pub async fn fetch_wallet_metadata(&self, deadline: Duration) -> Result<WalletMetadata> {
        let relays = self.init.await_ready(deadline).await?;
        if relays.is_empty() {
            return Err(Failure::network("no response subscriptions available"));
        }

        let filter = info_filter(self.wallet_pubkey);
        let query_timeout = self.config.metadata_query_timeout;
        let mut queries: FuturesUnordered<_> = relays
            .iter()
            .map(|relay| {
                let session = Arc::clone(&relay.handle.session);
                let filter = filter.clone();
                let url = relay.handle.url.clone();
                async move {
                    let outcome = session
                        .query(filter, query_timeout, RetryConfig::default())
                        .await;
                    (url, outcome)
                }
            })
            .collect();

        while let Some((url, outcome)) = queries.next().await {
            match outcome {
                QueryOutcome::Events(events) => {
                    let info = events.into_iter().find(|event| {
                        event.kind == Kind::WalletConnectInfo && event.pubkey == self.wallet_pubkey
                    });
                    if let Some(event) = info {
                        tracing::debug!("wallet info event served by {url}");
                        return Ok(codec::parse_info_event(&event));
                    }
                }
                QueryOutcome::Timeout => tracing::debug!("info query on {url} timed out"),
                QueryOutcome::ConnectionFailed(err) => {
                    tracing::debug!("info query on {url} failed: {err}")
                }
            }
        }
        Err(Failure::network("unable to fetch wallet metadata"))
    }
}

/// Deadline time left after `started`; none left is a Timeout.
fn remaining(deadline: Duration, started: tokio::time::Instant) -> Result<Duration> {
    let left = deadline.saturating_sub(started.elapsed());
    if left.is_zero() {
        return Err(Failure::timeout(format!(
            "deadline of {deadline:?} consumed while waiting for relay setup"
        )));
    }
    Ok(left)
}

/// Races one `request_one_via` exchange per ready relay. The first relay
/// that produces the correlated event wins and the slower exchanges are
/// dropped. When nobody wins the aggregate prefers Timeout over
/// ConnectionFailed and defaults to Timeout.
async fn race(
    relays: &[ReadyRelay],
    event: &Event,
    correlation: &EventId,
    deadline: Duration,
) -> RequestOutcome {
    let mut exchanges: FuturesUnordered<_> = relays
        .iter()
        .map(|relay| {
            let session = Arc::clone(&relay.handle.session);
            let subscription = relay.subscription.clone();
            let url = relay.handle.url.clone();
            async move {
                let outcome = session
                    .request_one_via(
                        &subscription,
                        event,
                        correlation,
                        deadline,
                        RetryConfig::default(),
                    )
                    .await;
                (url, outcome)
            }
        })
        .collect();

    let mut saw_timeout = false;
    let mut first_failure: Option<String> = None;
    while let Some((url, outcome)) = exchanges.next().await {
        match outcome {
            RequestOutcome::Event(response) => {
                tracing::debug!("relay {url} answered first");
                return RequestOutcome::Event(response);
            }
            RequestOutcome::Timeout => {
                tracing::debug!("relay {url} timed out");
                saw_timeout = true;
            }
            RequestOutcome::ConnectionFailed(err) => {
                tracing::debug!("relay {url} failed: {err}");
                if first_failure.is_none() {
                    first_failure = Some(err);
                }
            }
        }
    }
    match (saw_timeout, first_failure) {
        (false, Some(err)) => RequestOutcome::ConnectionFailed(err),
        _ => RequestOutcome::Timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_event_carries_wallet_tag_and_scheme() {
        let client = Keys::generate();
        let wallet = Keys::generate();
        let cipher = WalletCipher::new(client.secret_key().clone(), wallet.public_key());

        let event = build_request_event(
            &client,
            wallet.public_key(),
            &cipher,
            &EncryptionScheme::Nip44V2,
            None,
            Method::GetBalance,
            &json!({}),
        )
        .unwrap();

        assert_eq!(event.kind, Kind::WalletConnectRequest);
        assert_eq!(
            codec::first_tag_value(&event, "p"),
            Some(wallet.public_key().to_hex())
        );
        assert_eq!(
            codec::first_tag_value(&event, ENCRYPTION_TAG),
            Some("nip44_v2".to_string())
        );

        // The wallet can decrypt the body with the advertised scheme.
        let wallet_cipher = WalletCipher::new(wallet.secret_key().clone(), client.public_key());
        let plaintext = wallet_cipher
            .decrypt(&event.content, &EncryptionScheme::Nip44V2)
            .unwrap();
        let body: Value = serde_json::from_str(&plaintext).unwrap();
        assert_eq!(body["method"], "get_balance");
    }

    #[test]
    fn request_event_can_carry_expiration() {
        let client = Keys::generate();
        let wallet = Keys::generate();
        let cipher = WalletCipher::new(client.secret_key().clone(), wallet.public_key());

        let event = build_request_event(
            &client,
            wallet.public_key(),
            &cipher,
            &EncryptionScheme::Nip04,
            Some(Duration::from_secs(300)),
            Method::PayInvoice,
            &json!({ "invoice": "lnbc1invoice" }),
        )
        .unwrap();

        let expiration = codec::first_tag_value(&event, "expiration")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap();
        assert!(expiration >= event.created_at.as_u64() + 299);
    }

    #[test]
    fn unknown_scheme_never_signs_an_event() {
        let client = Keys::generate();
        let wallet = Keys::generate();
        let cipher = WalletCipher::new(client.secret_key().clone(), wallet.public_key());

        let result = build_request_event(
            &client,
            wallet.public_key(),
            &cipher,
            &EncryptionScheme::Unknown("nip99".to_string()),
            None,
            Method::GetBalance,
            &json!({}),
        );
        assert!(matches!(
            result,
            Err(Failure::EncryptionUnsupported { .. })
        ));
    }

    #[test]
    fn shared_state_defaults_to_nip04() {
        let shared = SharedState::new();
        assert_eq!(shared.active_scheme(), EncryptionScheme::Nip04);
        shared.set_active_scheme(EncryptionScheme::Nip44V2);
        assert_eq!(shared.active_scheme(), EncryptionScheme::Nip44V2);
    }
}
