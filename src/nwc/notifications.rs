//! Wallet push notifications
//!
//! Decoded kind 23197 events, fanned out through a bounded broadcast
//! channel. Slow subscribers lose the oldest items rather than blocking
//! the inbound pipeline.

use tokio::sync::broadcast;

use crate::nwc::types::Transaction;

/// A decoded wallet notification.
#[derive(Debug, Clone, PartialEq)]
pub enum WalletNotification {
    PaymentReceived(Transaction),
    PaymentSent(Transaction),
}

impl WalletNotification {
    pub fn transaction(&self) -> &Transaction {
        match self {
            WalletNotification::PaymentReceived(tx) | WalletNotification::PaymentSent(tx) => tx,
        }
    }
}

/// Creates the notification fan-out channel with the configured capacity.
pub fn channel(capacity: usize) -> broadcast::Sender<WalletNotification> {
    broadcast::channel(capacity.max(1)).0
}
