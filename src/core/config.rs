//! Client tuning configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deadline applied when the caller does not supply one.
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(60);

/// Per-relay timeout for creating the shared response subscription.
pub const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between recovery attempts for relays that missed initialization.
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(3);

/// Capacity of the wallet-notification broadcast channel. Slow subscribers
/// lose the oldest items rather than blocking the pipeline.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;

/// Upper bound on a detached observable request task so it cannot leak
/// forever when the caller never cancels it.
pub const DEFAULT_OBSERVABLE_DEADLINE: Duration = Duration::from_secs(600);

/// Timeout for kind 13194 wallet-info queries during metadata refresh.
pub const DEFAULT_METADATA_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub request_deadline: Duration,
    pub subscription_timeout: Duration,
    pub recovery_interval: Duration,
    pub notification_capacity: usize,
    pub observable_deadline: Duration,
    pub metadata_query_timeout: Duration,
    /// When set, request events carry an `expiration` tag this far in the
    /// future so relays can drop stale requests.
    pub request_expiry: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_deadline: DEFAULT_REQUEST_DEADLINE,
            subscription_timeout: DEFAULT_SUBSCRIPTION_TIMEOUT,
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            observable_deadline: DEFAULT_OBSERVABLE_DEADLINE,
            metadata_query_timeout: DEFAULT_METADATA_QUERY_TIMEOUT,
            request_expiry: None,
        }
    }
}
