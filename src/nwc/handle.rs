//! Observable request handle
//!
//! Wraps a background request task behind a `watch`-backed state snapshot:
//! Loading until the engine produces a terminal Success or Failure. Late
//! subscribers always see the current snapshot. Cancellation aborts only
//! the task; the protocol event may already have been sent.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use nostr_sdk::prelude::*;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::error::{Failure, Result};
use crate::nwc::types::RequestState;

pub struct RequestHandle<T> {
    state_rx: watch::Receiver<RequestState<T>>,
    task: Option<JoinHandle<()>>,
    event_id: Option<EventId>,
    cancelled: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> RequestHandle<T> {
    /// Spawns the background request task. `cap` bounds the task so it
    /// cannot leak forever when the caller never cancels it.
    pub(crate) fn spawn<F>(event_id: Option<EventId>, cap: Duration, request: F) -> Self
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(RequestState::Loading);
        let task = tokio::spawn(async move {
            let outcome = tokio::time::timeout(cap, AssertUnwindSafe(request).catch_unwind()).await;
            let result = match outcome {
                Err(_) => Err(Failure::timeout(format!("request abandoned after {cap:?}"))),
                Ok(Err(panic)) => Err(Failure::unknown_caused(
                    "request task panicked",
                    panic_message(panic.as_ref()),
                )),
                Ok(Ok(result)) => result,
            };
            let state = match result {
                Ok(value) => RequestState::Success(value),
                Err(failure) => RequestState::Failure(failure),
            };
            let _ = state_tx.send(state);
        });
        Self {
            state_rx,
            task: Some(task),
            event_id,
            cancelled: AtomicBool::new(false),
        }
    }

    /// A handle that failed before the request event could be built.
    pub(crate) fn failed(failure: Failure) -> Self {
        let (_state_tx, state_rx) = watch::channel(RequestState::Failure(failure));
        Self {
            state_rx,
            task: None,
            event_id: None,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Id of the request event, for diagnostic correlation with relay logs.
    pub fn event_id(&self) -> Option<&EventId> {
        self.event_id.as_ref()
    }

    /// Current state snapshot.
    pub fn state(&self) -> RequestState<T> {
        self.state_rx.borrow().clone()
    }

    /// Subscribes to state changes; the receiver immediately holds the
    /// current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<RequestState<T>> {
        self.state_rx.clone()
    }

    pub fn is_active(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        self.state().is_loading()
            && self
                .task
                .as_ref()
                .map(|task| !task.is_finished())
                .unwrap_or(false)
    }

    /// Aborts the background task. The stored state stays whatever it was;
    /// a request event that already went out is not recalled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// First non-Loading state, or `None` when `deadline` elapses first
    /// (or the task was cancelled before reaching a terminal state).
    pub async fn await_result(&self, deadline: Option<Duration>) -> Option<RequestState<T>> {
        let mut state_rx = self.state_rx.clone();
        let wait = async move {
            state_rx
                .wait_for(|state| !state.is_loading())
                .await
                .ok()
                .map(|state| state.clone())
        };
        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, wait).await.ok().flatten(),
            None => wait.await,
        }
    }

    /// Terminal state as a `Result`; an elapsed deadline maps to Timeout.
    pub async fn to_result(&self, deadline: Duration) -> Result<T> {
        match self.await_result(Some(deadline)).await {
            Some(RequestState::Success(value)) => Ok(value),
            Some(RequestState::Failure(failure)) => Err(failure),
            Some(RequestState::Loading) | None => Err(Failure::timeout(format!(
                "no terminal request state within {deadline:?}"
            ))),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminal_state_is_observable() {
        let handle = RequestHandle::spawn(None, Duration::from_secs(5), async { Ok(21u64) });
        let state = handle.await_result(Some(Duration::from_secs(1))).await;
        assert!(matches!(state, Some(RequestState::Success(21))));
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn cancel_keeps_loading_state() {
        let handle: RequestHandle<u64> =
            RequestHandle::spawn(None, Duration::from_secs(600), async {
                std::future::pending::<()>().await;
                Ok(0)
            });
        assert!(handle.is_active());
        handle.cancel();
        assert!(!handle.is_active());

        // The aborted task can never flip the state to a terminal value.
        tokio::task::yield_now().await;
        assert!(handle.state().is_loading());
        assert!(handle
            .await_result(Some(Duration::from_millis(50)))
            .await
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn internal_cap_bounds_the_task() {
        let handle: RequestHandle<u64> =
            RequestHandle::spawn(None, Duration::from_millis(100), async {
                std::future::pending::<()>().await;
                Ok(0)
            });
        let state = handle.await_result(None).await;
        assert!(matches!(state, Some(RequestState::Failure(Failure::Timeout { .. }))));
    }

    #[tokio::test]
    async fn panics_surface_as_unknown_failures() {
        let handle: RequestHandle<u64> =
            RequestHandle::spawn(None, Duration::from_secs(5), async {
                panic!("wallet payload made no sense");
            });
        let state = handle.await_result(Some(Duration::from_secs(1))).await;
        match state {
            Some(RequestState::Failure(Failure::Unknown { cause, .. })) => {
                assert_eq!(cause.as_deref(), Some("wallet payload made no sense"));
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn to_result_times_out_on_loading_handles() {
        let handle: RequestHandle<u64> =
            RequestHandle::spawn(None, Duration::from_secs(600), async {
                std::future::pending::<()>().await;
                Ok(0)
            });
        let result = handle.to_result(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Failure::Timeout { .. })));
        handle.cancel();
    }
}
