//! Pending request registry
//!
//! Maps correlation ids (request event ids) to single or multi awaiters.
//! All operations are linearizable under one mutex; the lock is released
//! before any completion signal fires and oneshot sends never block.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::core::error::{Failure, NwcError, Result};
use crate::nwc::types::{Method, RawResponse};

/// A registered awaiter for one in-flight request.
pub enum Pending {
    Single {
        method: Method,
        tx: oneshot::Sender<RawResponse>,
    },
    Multi {
        method: Method,
        expected: HashSet<String>,
        results: HashMap<String, RawResponse>,
        tx: oneshot::Sender<HashMap<String, RawResponse>>,
    },
}

impl Pending {
    fn method(&self) -> Method {
        match self {
            Pending::Single { method, .. } | Pending::Multi { method, .. } => *method,
        }
    }
}

/// Outcome of feeding a response into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    SingleCompleted,
    Partial,
    MultiCompleted,
    /// No entry for the correlation id, or the entry kind did not match.
    NotFound,
    /// The multi key was already filled; first arrival wins.
    Duplicate,
}

#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, Pending>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an awaiter. Correlation ids are signed event ids, so a
    /// duplicate means the caller reused a request event.
    pub fn register(&self, id: &str, pending: Pending) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            return Err(Failure::unknown(format!(
                "request {id} is already registered"
            )));
        }
        entries.insert(id.to_string(), pending);
        Ok(())
    }

    /// Completes a single request; at most one terminal completion per id.
    pub fn complete_single(&self, id: &str, response: RawResponse) -> Completion {
        let mut entries = self.entries.lock();
        if !matches!(entries.get(id), Some(Pending::Single { .. })) {
            return Completion::NotFound;
        }
        let Some(Pending::Single { tx, .. }) = entries.remove(id) else {
            return Completion::NotFound;
        };
        drop(entries);
        // Receiver may be gone when the request already timed out.
        let _ = tx.send(response);
        Completion::SingleCompleted
    }

    /// Adds one keyed result to a multi request. The entry completes with a
    /// snapshot of the result map once every expected key is present.
    pub fn add_multi(&self, id: &str, key: &str, response: RawResponse) -> Completion {
        let mut entries = self.entries.lock();
        let Some(Pending::Multi {
            expected, results, ..
        }) = entries.get_mut(id)
        else {
            return Completion::NotFound;
        };

        if results.contains_key(key) {
            return Completion::Duplicate;
        }
        results.insert(key.to_string(), response);

        let complete = expected.iter().all(|expected| results.contains_key(expected));
        if !complete {
            return Completion::Partial;
        }
        let Some(Pending::Multi { results, tx, .. }) = entries.remove(id) else {
            return Completion::NotFound;
        };
        drop(entries);
        let _ = tx.send(results);
        Completion::MultiCompleted
    }

    /// Fans an error out to the awaiter: a single request gets a synthetic
    /// errored response, a multi request gets the error under every
    /// expected key.
    pub fn complete_with_error(&self, id: &str, error: NwcError) -> Completion {
        let mut entries = self.entries.lock();
        match entries.remove(id) {
            Some(Pending::Single { method, tx }) => {
                drop(entries);
                let _ = tx.send(errored_response(method, error));
                Completion::SingleCompleted
            }
            Some(Pending::Multi {
                method,
                expected,
                mut results,
                tx,
            }) => {
                drop(entries);
                for key in expected {
                    results
                        .entry(key)
                        .or_insert_with(|| errored_response(method, error.clone()));
                }
                let _ = tx.send(results);
                Completion::MultiCompleted
            }
            None => Completion::NotFound,
        }
    }

    /// Disambiguates a response that carried no `e` tag: a lone pending
    /// entry wins, otherwise a unique entry whose method matches the
    /// response's `result_type` does. Anything else gives up.
    pub fn resolve_request_id(&self, result_type: &str) -> Option<String> {
        let entries = self.entries.lock();
        if entries.len() == 1 {
            return entries.keys().next().cloned();
        }
        let mut matching = entries
            .iter()
            .filter(|(_, pending)| pending.method().as_str() == result_type)
            .map(|(id, _)| id.clone());
        let candidate = matching.next()?;
        if matching.next().is_some() {
            return None;
        }
        Some(candidate)
    }

    /// Drops an entry without signalling, e.g. after a timeout.
    pub fn remove(&self, id: &str) -> Option<Pending> {
        self.entries.lock().remove(id)
    }

    /// Cancels every awaiter by dropping its completion sender and clears
    /// the table.
    pub fn cancel_all(&self) {
        let drained: Vec<Pending> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, pending)| pending).collect()
        };
        tracing::debug!("cancelling {} pending requests", drained.len());
        drop(drained);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn errored_response(method: Method, error: NwcError) -> RawResponse {
    RawResponse {
        result_type: method.as_str().to_string(),
        result: None,
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(result_type: &str) -> RawResponse {
        RawResponse {
            result_type: result_type.to_string(),
            result: Some(json!({ "balance": 1000 })),
            error: None,
        }
    }

    #[test]
    fn single_completion_signals_once_and_clears_entry() {
        let registry = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        registry
            .register(
                "event-1",
                Pending::Single {
                    method: Method::GetBalance,
                    tx,
                },
            )
            .unwrap();
        assert_eq!(registry.len(), 1);

        assert_eq!(
            registry.complete_single("event-1", response("get_balance")),
            Completion::SingleCompleted
        );
        assert!(registry.is_empty());
        assert!(rx.try_recv().is_ok());

        // A second completion must find nothing.
        assert_eq!(
            registry.complete_single("event-1", response("get_balance")),
            Completion::NotFound
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = PendingRequests::new();
        let (tx, _rx) = oneshot::channel();
        registry
            .register(
                "event-1",
                Pending::Single {
                    method: Method::GetBalance,
                    tx,
                },
            )
            .unwrap();
        let (tx, _rx) = oneshot::channel();
        assert!(registry
            .register(
                "event-1",
                Pending::Single {
                    method: Method::GetBalance,
                    tx,
                },
            )
            .is_err());
    }

    #[test]
    fn multi_completes_when_all_expected_keys_arrive() {
        let registry = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        registry
            .register(
                "event-1",
                Pending::Multi {
                    method: Method::MultiPayInvoice,
                    expected: ["a".to_string(), "b".to_string()].into_iter().collect(),
                    results: HashMap::new(),
                    tx,
                },
            )
            .unwrap();

        assert_eq!(
            registry.add_multi("event-1", "a", response("multi_pay_invoice")),
            Completion::Partial
        );
        assert_eq!(
            registry.add_multi("event-1", "a", response("multi_pay_invoice")),
            Completion::Duplicate
        );
        assert_eq!(
            registry.add_multi("event-1", "b", response("multi_pay_invoice")),
            Completion::MultiCompleted
        );

        let results = rx.try_recv().unwrap();
        assert_eq!(results.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn error_fans_out_to_every_expected_key() {
        let registry = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        registry
            .register(
                "event-1",
                Pending::Multi {
                    method: Method::MultiPayInvoice,
                    expected: ["a".to_string(), "b".to_string()].into_iter().collect(),
                    results: HashMap::new(),
                    tx,
                },
            )
            .unwrap();
        registry.add_multi("event-1", "a", response("multi_pay_invoice"));

        registry.complete_with_error("event-1", NwcError::new("INTERNAL", "relay gave up"));
        let results = rx.try_recv().unwrap();
        assert_eq!(results.len(), 2);
        // The key that already has a result keeps it.
        assert!(results["a"].error.is_none());
        assert_eq!(results["b"].error.as_ref().unwrap().code, "INTERNAL");
    }

    #[test]
    fn resolver_prefers_lone_entry_then_unique_method() {
        let registry = PendingRequests::new();
        let (tx, _rx1) = oneshot::channel();
        registry
            .register(
                "event-1",
                Pending::Single {
                    method: Method::GetBalance,
                    tx,
                },
            )
            .unwrap();
        assert_eq!(
            registry.resolve_request_id("anything"),
            Some("event-1".to_string())
        );

        let (tx, _rx2) = oneshot::channel();
        registry
            .register(
                "event-2",
                Pending::Single {
                    method: Method::PayInvoice,
                    tx,
                },
            )
            .unwrap();
        assert_eq!(
            registry.resolve_request_id("pay_invoice"),
            Some("event-2".to_string())
        );
        assert_eq!(registry.resolve_request_id("make_invoice"), None);

        let (tx, _rx3) = oneshot::channel();
        registry
            .register(
                "event-3",
                Pending::Single {
                    method: Method::PayInvoice,
                    tx,
                },
            )
            .unwrap();
        // Two pay_invoice entries are ambiguous.
        assert_eq!(registry.resolve_request_id("pay_invoice"), None);
    }

    #[test]
    fn cancel_all_drops_completion_senders() {
        let registry = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        registry
            .register(
                "event-1",
                Pending::Single {
                    method: Method::GetBalance,
                    tx,
                },
            )
            .unwrap();
        registry.cancel_all();
        assert!(registry.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
