//! NWC client façade
//!
//! Typed entry points for every NIP-47 method, each in two forms: a
//! suspending call bounded by a deadline, and an observable call returning
//! a `RequestHandle` immediately. Construction is non-blocking; relay setup
//! runs in the background and every request first awaits readiness.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::core::config::ClientConfig;
use crate::core::credentials::Credentials;
use crate::core::error::{Failure, NwcError, Result};
use crate::nwc::codec;
use crate::nwc::crypto::{self, WalletCipher};
use crate::nwc::engine::{notification_filters, response_filter, RequestEngine, SharedState};
use crate::nwc::handle::{panic_message, RequestHandle};
use crate::nwc::init::Initializer;
use crate::nwc::notifications::{self, WalletNotification};
use crate::nwc::pending::PendingRequests;
use crate::nwc::relay::RelayManager;
use crate::nwc::router::Router;
use crate::nwc::session::{self, ConnectionState, SessionProvider};
use crate::nwc::types::{
    GetInfoResult, ListTransactionsParams, LookupInvoiceParams, MakeInvoiceParams, Method,
    MultiPayInvoiceEntry, MultiPayKeysendEntry, MultiResult, PayInvoiceParams, PayKeysendParams,
    PayResult, RawResponse, Transaction, WalletDescriptor, WalletMetadata,
};

/// Nostr Wallet Connect client.
///
/// Cheap to clone; all clones share the same sessions, pending registry and
/// notification channel. Must be created inside a tokio runtime because
/// construction spawns the background initialization and router tasks.
#[derive(Clone)]
pub struct NwcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    credentials: Credentials,
    config: ClientConfig,
    provider: Arc<dyn SessionProvider>,
    /// Whether `close()` should also close the provider. Only sessions the
    /// client allocated itself are released.
    owns_provider: bool,
    shared: Arc<SharedState>,
    pending: Arc<PendingRequests>,
    init: Arc<Initializer>,
    engine: RequestEngine,
    notifications_tx: broadcast::Sender<WalletNotification>,
    router_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl NwcClient {
    /// Creates a client over the default nostr-sdk relay pool.
    pub fn new(credentials: Credentials) -> Self {
        let provider = Arc::new(RelayManager::new(
            credentials.client_keys(),
            credentials.relays.clone(),
        ));
        Self::build(credentials, provider, ClientConfig::default(), true)
    }

    /// Creates a client from a `nostr+walletconnect://` URI.
    pub fn from_uri(uri: &str) -> Result<Self> {
        Ok(Self::new(Credentials::from_uri(uri)?))
    }

    /// Creates a client over an externally owned session provider. The
    /// provider is not closed by `close()`.
    pub fn with_provider(
        credentials: Credentials,
        provider: Arc<dyn SessionProvider>,
        config: ClientConfig,
    ) -> Self {
        Self::build(credentials, provider, config, false)
    }

    fn build(
        credentials: Credentials,
        provider: Arc<dyn SessionProvider>,
        config: ClientConfig,
        owns_provider: bool,
    ) -> Self {
        let keys = credentials.client_keys();
        let client_pubkey = keys.public_key();
        let wallet_pubkey = credentials.wallet_pubkey;
        let cipher = WalletCipher::new(credentials.secret.clone(), wallet_pubkey);

        let shared = Arc::new(SharedState::new());
        let pending = Arc::new(PendingRequests::new());
        let notifications_tx = notifications::channel(config.notification_capacity);

        let router = Arc::new(Router::new(
            wallet_pubkey,
            client_pubkey,
            cipher.clone(),
            Arc::clone(&shared),
            Arc::clone(&pending),
            notifications_tx.clone(),
        ));
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let router_task = Arc::clone(&router).spawn(sink_rx);

        let init = Initializer::new(
            Arc::clone(&provider),
            credentials.relays.clone(),
            response_filter(wallet_pubkey, client_pubkey),
            notification_filters(wallet_pubkey, client_pubkey),
            sink_tx,
            &config,
        );
        init.start();

        let engine = RequestEngine::new(
            keys,
            wallet_pubkey,
            cipher,
            Arc::clone(&shared),
            Arc::clone(&pending),
            Arc::clone(&init),
            router,
            config.clone(),
        );

        Self {
            inner: Arc::new(ClientInner {
                credentials,
                config,
                provider,
                owns_provider,
                shared,
                pending,
                init,
                engine,
                notifications_tx,
                router_task: Mutex::new(Some(router_task)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    /// Subscribes to decoded wallet notifications. Slow subscribers lose
    /// the oldest items rather than blocking the pipeline.
    pub fn notifications(&self) -> broadcast::Receiver<WalletNotification> {
        self.inner.notifications_tx.subscribe()
    }

    /// Number of requests currently awaiting a response, for diagnostics.
    pub fn inflight_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Aggregate connection state across all relays.
    pub async fn connection_state(&self) -> ConnectionState {
        let mut snapshots = Vec::new();
        for handle in self.inner.provider.runtime_handles() {
            snapshots.push(handle.session.snapshot().await);
        }
        session::aggregate(&snapshots)
    }

    /// Cancels every pending awaiter, stops the background tasks and, when
    /// the client allocated the sessions itself, closes them. Key material
    /// is released once the last clone drops.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("closing NWC client");
        self.inner.pending.cancel_all();
        self.inner.init.shutdown();
        if let Some(task) = self.inner.router_task.lock().take() {
            task.abort();
        }
        if self.inner.owns_provider {
            self.inner.provider.close().await;
        }
    }

    // --- typed wallet operations -----------------------------------------

    /// Wallet balance in millisatoshis.
    pub async fn get_balance(&self, deadline: Duration) -> Result<u64> {
        self.inner
            .run_single(Method::GetBalance, empty_params(), deadline, |result| {
                codec::decode_balance(result)
            })
            .await
    }

    pub fn get_balance_request(&self) -> RequestHandle<u64> {
        self.observable(Method::GetBalance, Ok(empty_params()), |result| {
            codec::decode_balance(result)
        })
    }

    pub async fn get_info(&self, deadline: Duration) -> Result<GetInfoResult> {
        let shared = Arc::clone(&self.inner.shared);
        self.inner
            .run_single(Method::GetInfo, empty_params(), deadline, move |result| {
                let info = codec::decode_get_info(result)?;
                shared.set_info(info.clone());
                Ok(info)
            })
            .await
    }

    pub fn get_info_request(&self) -> RequestHandle<GetInfoResult> {
        let shared = Arc::clone(&self.inner.shared);
        self.observable(Method::GetInfo, Ok(empty_params()), move |result| {
            let info = codec::decode_get_info(result)?;
            shared.set_info(info.clone());
            Ok(info)
        })
    }

    pub async fn pay_invoice(
        &self,
        params: PayInvoiceParams,
        deadline: Duration,
    ) -> Result<PayResult> {
        self.inner
            .run_single(Method::PayInvoice, to_params(&params)?, deadline, |result| {
                codec::decode_pay(result)
            })
            .await
    }

    pub fn pay_invoice_request(&self, params: PayInvoiceParams) -> RequestHandle<PayResult> {
        self.observable(Method::PayInvoice, to_params(&params), |result| {
            codec::decode_pay(result)
        })
    }

    pub async fn multi_pay_invoice(
        &self,
        invoices: Vec<MultiPayInvoiceEntry>,
        deadline: Duration,
    ) -> Result<HashMap<String, MultiResult<PayResult>>> {
        let (ids, items) = prepare_batch(invoices)?;
        self.inner
            .run_multi(Method::MultiPayInvoice, "invoices", items, ids, deadline)
            .await
            .map(|results| translate_multi(results, codec::decode_pay))
    }

    pub fn multi_pay_invoice_request(
        &self,
        invoices: Vec<MultiPayInvoiceEntry>,
    ) -> RequestHandle<HashMap<String, MultiResult<PayResult>>> {
        self.observable_multi(
            Method::MultiPayInvoice,
            "invoices",
            prepare_batch(invoices),
            codec::decode_pay,
        )
    }

    pub async fn pay_keysend(
        &self,
        params: PayKeysendParams,
        deadline: Duration,
    ) -> Result<PayResult> {
        self.inner
            .run_single(Method::PayKeysend, to_params(&params)?, deadline, |result| {
                codec::decode_pay(result)
            })
            .await
    }

    pub fn pay_keysend_request(&self, params: PayKeysendParams) -> RequestHandle<PayResult> {
        self.observable(Method::PayKeysend, to_params(&params), |result| {
            codec::decode_pay(result)
        })
    }

    pub async fn multi_pay_keysend(
        &self,
        keysends: Vec<MultiPayKeysendEntry>,
        deadline: Duration,
    ) -> Result<HashMap<String, MultiResult<PayResult>>> {
        let (ids, items) = prepare_batch(keysends)?;
        self.inner
            .run_multi(Method::MultiPayKeysend, "keysends", items, ids, deadline)
            .await
            .map(|results| translate_multi(results, codec::decode_pay))
    }

    pub fn multi_pay_keysend_request(
        &self,
        keysends: Vec<MultiPayKeysendEntry>,
    ) -> RequestHandle<HashMap<String, MultiResult<PayResult>>> {
        self.observable_multi(
            Method::MultiPayKeysend,
            "keysends",
            prepare_batch(keysends),
            codec::decode_pay,
        )
    }

    pub async fn make_invoice(
        &self,
        params: MakeInvoiceParams,
        deadline: Duration,
    ) -> Result<Transaction> {
        self.inner
            .run_single(Method::MakeInvoice, to_params(&params)?, deadline, |result| {
                codec::parse_transaction(result)
            })
            .await
    }

    pub fn make_invoice_request(&self, params: MakeInvoiceParams) -> RequestHandle<Transaction> {
        self.observable(Method::MakeInvoice, to_params(&params), |result| {
            codec::parse_transaction(result)
        })
    }

    pub async fn lookup_invoice(
        &self,
        params: LookupInvoiceParams,
        deadline: Duration,
    ) -> Result<Transaction> {
        let params = validated_lookup(params)?;
        self.inner
            .run_single(Method::LookupInvoice, to_params(&params)?, deadline, |result| {
                codec::parse_transaction(result)
            })
            .await
    }

    pub fn lookup_invoice_request(&self, params: LookupInvoiceParams) -> RequestHandle<Transaction> {
        let params = match validated_lookup(params) {
            Ok(params) => params,
            Err(failure) => return RequestHandle::failed(failure),
        };
        self.observable(Method::LookupInvoice, to_params(&params), |result| {
            codec::parse_transaction(result)
        })
    }

    pub async fn list_transactions(
        &self,
        params: ListTransactionsParams,
        deadline: Duration,
    ) -> Result<Vec<Transaction>> {
        self.inner
            .run_single(
                Method::ListTransactions,
                to_params(&params)?,
                deadline,
                |result| codec::decode_transactions(result),
            )
            .await
    }

    pub fn list_transactions_request(
        &self,
        params: ListTransactionsParams,
    ) -> RequestHandle<Vec<Transaction>> {
        self.observable(Method::ListTransactions, to_params(&params), |result| {
            codec::decode_transactions(result)
        })
    }

    /// Re-reads the wallet's kind 13194 info event, stores the metadata and
    /// renegotiates the active encryption scheme.
    pub async fn refresh_wallet_metadata(&self, deadline: Duration) -> Result<WalletMetadata> {
        self.inner.check_open()?;
        let metadata = self.inner.engine.fetch_wallet_metadata(deadline).await?;
        self.inner.shared.set_metadata(metadata.clone());
        let scheme = crypto::select_scheme(&metadata)?;
        tracing::info!("active encryption scheme: {scheme}");
        self.inner.shared.set_active_scheme(scheme);
        Ok(metadata)
    }

    pub fn refresh_wallet_metadata_request(&self) -> RequestHandle<WalletMetadata> {
        let client = self.clone();
        let deadline = self.inner.config.request_deadline;
        RequestHandle::spawn(None, self.inner.config.observable_deadline, async move {
            client.refresh_wallet_metadata(deadline).await
        })
    }

    /// Merged view of the connection: canonical URI, latest metadata and
    /// info (fetched when not yet cached) and the negotiated scheme.
    pub async fn describe_wallet(&self, deadline: Duration) -> Result<WalletDescriptor> {
        let metadata = match self.inner.shared.metadata() {
            Some(metadata) => metadata,
            None => self.refresh_wallet_metadata(deadline).await?,
        };
        let info = match self.inner.shared.info() {
            Some(info) => info,
            None => self.get_info(deadline).await?,
        };
        Ok(WalletDescriptor {
            uri: self.inner.credentials.to_uri(),
            metadata,
            info,
            encryption: self.inner.shared.active_scheme(),
        })
    }

    pub fn describe_wallet_request(&self) -> RequestHandle<WalletDescriptor> {
        let client = self.clone();
        let deadline = self.inner.config.request_deadline;
        RequestHandle::spawn(None, self.inner.config.observable_deadline, async move {
            client.describe_wallet(deadline).await
        })
    }

    // --- plumbing ---------------------------------------------------------

    fn observable<T, F>(&self, method: Method, params: Result<Value>, decode: F) -> RequestHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Value) -> Result<T> + Send + Sync + 'static,
    {
        let params = match params {
            Ok(params) => params,
            Err(failure) => return RequestHandle::failed(failure),
        };
        if let Err(failure) = self.inner.check_open() {
            return RequestHandle::failed(failure);
        }
        let prepared = match self.inner.engine.prepare(method, &params) {
            Ok(prepared) => prepared,
            Err(failure) => return RequestHandle::failed(failure),
        };
        let event_id = prepared.event.id;
        let inner = Arc::clone(&self.inner);
        let deadline = inner.config.request_deadline;
        RequestHandle::spawn(
            Some(event_id),
            self.inner.config.observable_deadline,
            async move {
                let result = inner.engine.execute_single(prepared, deadline).await?;
                decode(&result)
            },
        )
    }

    fn observable_multi<T, F>(
        &self,
        method: Method,
        list_key: &'static str,
        batch: Result<(Vec<String>, Vec<Value>)>,
        decode: F,
    ) -> RequestHandle<HashMap<String, MultiResult<T>>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Value) -> Result<T> + Send + Sync + 'static,
    {
        let (ids, items) = match batch {
            Ok(batch) => batch,
            Err(failure) => return RequestHandle::failed(failure),
        };
        if let Err(failure) = self.inner.check_open() {
            return RequestHandle::failed(failure);
        }
        let params = batch_params(list_key, items);
        let prepared = match self.inner.engine.prepare(method, &params) {
            Ok(prepared) => prepared,
            Err(failure) => return RequestHandle::failed(failure),
        };
        let event_id = prepared.event.id;
        let inner = Arc::clone(&self.inner);
        let deadline = inner.config.request_deadline;
        RequestHandle::spawn(
            Some(event_id),
            self.inner.config.observable_deadline,
            async move {
                let results = inner.engine.execute_multi(prepared, ids, deadline).await?;
                Ok(translate_multi(results, decode))
            },
        )
    }
}

fn empty_params() -> Value {
    Value::Object(serde_json::Map::new())
}

fn batch_params(list_key: &str, items: Vec<Value>) -> Value {
    let mut params = serde_json::Map::new();
    params.insert(list_key.to_string(), Value::Array(items));
    Value::Object(params)
}

fn to_params<P: serde::Serialize>(params: &P) -> Result<Value> {
    serde_json::to_value(params)
        .map_err(|e| Failure::protocol(format!("failed to serialize params: {e}")))
}

fn validated_lookup(params: LookupInvoiceParams) -> Result<LookupInvoiceParams> {
    if params.payment_hash.is_none() && params.invoice.is_none() {
        return Err(Failure::protocol(
            "lookup_invoice requires payment_hash or invoice",
        ));
    }
    Ok(params)
}

/// Fills in missing batch item ids with random 8-byte hex values and
/// rejects duplicate ids, which would corrupt response correlation.
fn prepare_batch<E: BatchEntry>(entries: Vec<E>) -> Result<(Vec<String>, Vec<Value>)> {
    let mut ids = Vec::with_capacity(entries.len());
    let mut items = Vec::with_capacity(entries.len());
    let mut seen: HashSet<String> = HashSet::new();
    for mut entry in entries {
        let id = entry
            .id_mut()
            .clone()
            .unwrap_or_else(|| hex::encode(rand::random::<[u8; 8]>()));
        if !seen.insert(id.clone()) {
            return Err(Failure::protocol(format!("duplicate batch item id {id}")));
        }
        *entry.id_mut() = Some(id.clone());
        ids.push(id);
        items.push(to_params(&entry)?);
    }
    Ok((ids, items))
}

trait BatchEntry: serde::Serialize {
    fn id_mut(&mut self) -> &mut Option<String>;
}

impl BatchEntry for MultiPayInvoiceEntry {
    fn id_mut(&mut self) -> &mut Option<String> {
        &mut self.id
    }
}

impl BatchEntry for MultiPayKeysendEntry {
    fn id_mut(&mut self) -> &mut Option<String> {
        &mut self.id
    }
}

/// Maps per-item raw responses to typed multi results. Wallet errors pass
/// through; a result that fails to decode degrades to an internal error
/// for that item only.
fn translate_multi<T>(
    results: HashMap<String, RawResponse>,
    decode: impl Fn(&Value) -> Result<T>,
) -> HashMap<String, MultiResult<T>> {
    results
        .into_iter()
        .map(|(id, response)| {
            let outcome = if let Some(error) = response.error {
                Err(error)
            } else {
                match response.result.as_ref() {
                    Some(result) => decode(result)
                        .map_err(|failure| NwcError::new("INTERNAL", failure.to_string())),
                    None => Err(NwcError::new(
                        "INTERNAL",
                        "response carried neither result nor error",
                    )),
                }
            };
            (id, outcome)
        })
        .collect()
}

impl ClientInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Failure::network("client is closed"));
        }
        Ok(())
    }

    async fn run_single<T>(
        &self,
        method: Method,
        params: Value,
        deadline: Duration,
        decode: impl Fn(&Value) -> Result<T>,
    ) -> Result<T> {
        self.check_open()?;
        let call = async {
            let prepared = self.engine.prepare(method, &params)?;
            let result = self.engine.execute_single(prepared, deadline).await?;
            decode(&result)
        };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(Failure::unknown_caused(
                format!("{method} request panicked"),
                panic_message(panic.as_ref()),
            )),
        }
    }

    async fn run_multi(
        &self,
        method: Method,
        list_key: &str,
        items: Vec<Value>,
        ids: Vec<String>,
        deadline: Duration,
    ) -> Result<HashMap<String, RawResponse>> {
        self.check_open()?;
        let call = async {
            let params = batch_params(list_key, items);
            let prepared = self.engine.prepare(method, &params)?;
            self.engine.execute_multi(prepared, ids, deadline).await
        };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(Failure::unknown_caused(
                format!("{method} request panicked"),
                panic_message(panic.as_ref()),
            )),
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // Belt and braces when the caller never called close().
        self.init.shutdown();
        if let Some(task) = self.router_task.lock().take() {
            task.abort();
        }
    }
}
