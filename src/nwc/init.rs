//! Deferred multi-relay initialization with background recovery
//!
//! Construction never blocks: setup runs in a background task that opens
//! the session, installs the notification and response subscriptions per
//! relay and drives the NotStarted → Initializing → Ready / PartialReady /
//! Failed transitions. A recovery task keeps retrying laggard relays.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::config::ClientConfig;
use crate::core::error::{Failure, Result};
use crate::nwc::session::{EventSink, SessionHandle, SessionProvider, SharedSubscription};

/// Logical id for the per-relay notification subscription.
const NOTIFICATION_SUB: &str = "nwc-notifications";

/// Lifecycle of the multi-relay setup.
#[derive(Debug, Clone, PartialEq)]
pub enum InitState {
    NotStarted,
    Initializing,
    Ready { ready: Vec<String> },
    PartialReady { ready: Vec<String>, pending: Vec<String> },
    Failed { cause: String },
}

impl InitState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            InitState::Ready { .. } | InitState::PartialReady { .. } | InitState::Failed { .. }
        )
    }
}

/// A relay that finished setup: its session plus the shared response
/// subscription requests race over.
#[derive(Clone)]
pub struct ReadyRelay {
    pub handle: SessionHandle,
    pub subscription: SharedSubscription,
}

pub struct Initializer {
    /// Self-reference so `&self` methods can hand an owned handle to the
    /// background tasks they spawn.
    weak: Weak<Self>,
    provider: Arc<dyn SessionProvider>,
    expected_relays: Vec<String>,
    response_filter: Filter,
    notification_filters: Vec<Filter>,
    sink: EventSink,
    state_tx: watch::Sender<InitState>,
    state_rx: watch::Receiver<InitState>,
    subscriptions: Mutex<HashMap<String, SharedSubscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscription_timeout: Duration,
    recovery_interval: Duration,
}

impl Initializer {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        expected_relays: Vec<String>,
        response_filter: Filter,
        notification_filters: Vec<Filter>,
        sink: EventSink,
        config: &ClientConfig,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(InitState::NotStarted);
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            provider,
            expected_relays,
            response_filter,
            notification_filters,
            sink,
            state_tx,
            state_rx,
            subscriptions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            subscription_timeout: config.subscription_timeout,
            recovery_interval: config.recovery_interval,
        })
    }

    pub fn state(&self) -> InitState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<InitState> {
        self.state_rx.clone()
    }

    /// Kicks off background setup; the caller is never blocked.
    pub fn start(&self) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let task = tokio::spawn(async move { this.run().await });
        self.tasks.lock().push(task);
    }

    async fn run(self: Arc<Self>) {
        self.state_tx.send_replace(InitState::Initializing);

        if let Err(err) = self.provider.open(self.sink.clone()).await {
            tracing::warn!("session open failed: {err}");
            self.state_tx.send_replace(InitState::Failed {
                cause: err.to_string(),
            });
            self.spawn_recovery(self.expected_relays.clone());
            return;
        }

        let handles = self.provider.runtime_handles();
        let setups = handles.iter().map(|handle| self.setup_relay(handle));
        let outcomes = join_all(setups).await;

        let mut ready = Vec::new();
        let mut pending = Vec::new();
        for (handle, succeeded) in handles.iter().zip(outcomes) {
            if succeeded {
                ready.push(handle.url.clone());
            } else {
                pending.push(handle.url.clone());
            }
        }
        // Configured relays the runtime no longer reports count as pending.
        for url in &self.expected_relays {
            if !handles.iter().any(|handle| &handle.url == url) && !pending.contains(url) {
                pending.push(url.clone());
            }
        }

        let next = if !ready.is_empty() && pending.is_empty() {
            InitState::Ready { ready }
        } else if !ready.is_empty() {
            tracing::warn!("relays without response subscription: {pending:?}");
            self.spawn_recovery(pending.clone());
            InitState::PartialReady { ready, pending }
        } else {
            self.spawn_recovery(self.expected_relays.clone());
            InitState::Failed {
                cause: "no relay produced a response subscription".to_string(),
            }
        };
        self.state_tx.send_replace(next);
    }

    /// Installs the notification and response subscriptions on one relay.
    /// Returns whether the response subscription exists afterwards.
    async fn setup_relay(&self, handle: &SessionHandle) -> bool {
        if let Err(err) = handle
            .session
            .subscribe(NOTIFICATION_SUB, self.notification_filters.clone())
            .await
        {
            tracing::warn!("notification subscription on {} failed: {err}", handle.url);
        }

        match handle
            .session
            .create_shared_subscription(self.response_filter.clone(), self.subscription_timeout)
            .await
        {
            Some(subscription) => {
                self.subscriptions
                    .lock()
                    .insert(handle.url.clone(), subscription);
                tracing::debug!("response subscription ready on {}", handle.url);
                true
            }
            None => false,
        }
    }

    fn spawn_recovery(&self, pending: Vec<String>) {
        if pending.is_empty() {
            return;
        }
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let task = tokio::spawn(async move {
            let mut pending = pending;
            tracing::debug!("recovery started for {pending:?}");
            while !pending.is_empty() {
                tokio::time::sleep(this.recovery_interval).await;
                let mut still_pending = Vec::new();
                for url in pending {
                    if this.try_recover(&url).await {
                        tracing::info!("relay {url} recovered");
                        this.recompute_state();
                    } else {
                        still_pending.push(url);
                    }
                }
                pending = still_pending;
            }
        });
        self.tasks.lock().push(task);
    }

    async fn try_recover(&self, url: &str) -> bool {
        if let Err(err) = self.provider.ensure_relay(url).await {
            tracing::debug!("recovery: ensure_relay {url} failed: {err}");
            return false;
        }
        let Some(handle) = self
            .provider
            .runtime_handles()
            .into_iter()
            .find(|handle| handle.url == url)
        else {
            return false;
        };
        self.setup_relay(&handle).await
    }

    /// Recomputes Ready/PartialReady from the subscription table. Runs under
    /// the watch sender so promotions re-check state atomically.
    fn recompute_state(&self) {
        self.state_tx.send_modify(|state| {
            let subscriptions = self.subscriptions.lock();
            let ready: Vec<String> = self
                .expected_relays
                .iter()
                .filter(|url| subscriptions.contains_key(*url))
                .cloned()
                .collect();
            let pending: Vec<String> = self
                .expected_relays
                .iter()
                .filter(|url| !subscriptions.contains_key(*url))
                .cloned()
                .collect();
            if ready.is_empty() {
                return;
            }
            *state = if pending.is_empty() {
                InitState::Ready { ready }
            } else {
                InitState::PartialReady { ready, pending }
            };
        });
    }

    /// Waits for setup to reach a terminal state, restarting once after a
    /// previous Failed (the network may have come back). Returns the ready
    /// relay handles paired with their response subscriptions.
    pub async fn await_ready(&self, deadline: Duration) -> Result<Vec<ReadyRelay>> {
        if matches!(self.state(), InitState::Failed { .. }) {
            tracing::info!("relay setup previously failed, restarting");
            self.state_tx.send_replace(InitState::NotStarted);
            self.start();
        }

        let mut state_rx = self.state_rx.clone();
        let wait = state_rx.wait_for(InitState::is_terminal);
        let result = match tokio::time::timeout(deadline, wait).await {
            Err(_) => Err(Failure::timeout("timed out waiting for relay setup")),
            Ok(Err(_)) => Err(Failure::network("initializer shut down")),
            Ok(Ok(state)) => match &*state {
                InitState::Failed { cause } => {
                    Err(Failure::network_caused("relay setup failed", cause.clone()))
                }
                _ => Ok(self.ready_relays()),
            },
        };
        result
    }

    /// Runtime handles whose response subscription is installed.
    pub fn ready_relays(&self) -> Vec<ReadyRelay> {
        let subscriptions = self.subscriptions.lock();
        self.provider
            .runtime_handles()
            .into_iter()
            .filter_map(|handle| {
                subscriptions.get(&handle.url).map(|subscription| ReadyRelay {
                    subscription: subscription.clone(),
                    handle,
                })
            })
            .collect()
    }

    /// Aborts setup and recovery tasks.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
