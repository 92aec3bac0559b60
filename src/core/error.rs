//! Error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wallet-side NIP-47 error envelope carried in response events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NwcError {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl NwcError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for NwcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Failure taxonomy for every public client operation.
///
/// Expected failures are values, not panics: all entry points return
/// `Result<T>` and the conversion to a displayable error happens here via
/// `thiserror`. Cloneable so terminal states can fan out to observable
/// request handles.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Failure {
    /// Relay connectivity problems: connection refused, stream failure,
    /// every relay failed, or no response subscription is available.
    #[error("network failure: {msg}")]
    Network {
        msg: String,
        reason: Option<String>,
        close_code: Option<u16>,
        close_reason: Option<String>,
    },

    /// The end-to-end deadline elapsed before a response (or readiness).
    #[error("timed out: {msg}")]
    Timeout { msg: String },

    /// The wallet answered with an error envelope.
    #[error("wallet error [{}]: {}", .0.code, .0.message)]
    Wallet(NwcError),

    /// Malformed JSON, missing required fields, or an unexpected event kind.
    #[error("protocol error: {msg}")]
    Protocol { msg: String },

    /// The wallet advertises no encryption scheme this client supports.
    #[error("unsupported encryption: {msg}")]
    EncryptionUnsupported { msg: String },

    /// Anything that does not fit the categories above, including caught
    /// panics from background request tasks.
    #[error("unknown failure: {msg}")]
    Unknown { msg: String, cause: Option<String> },
}

impl Failure {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network {
            msg: msg.into(),
            reason: None,
            close_code: None,
            close_reason: None,
        }
    }

    pub fn network_caused(msg: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            msg: msg.into(),
            reason: Some(reason.into()),
            close_code: None,
            close_reason: None,
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout { msg: msg.into() }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol { msg: msg.into() }
    }

    pub fn encryption(msg: impl Into<String>) -> Self {
        Self::EncryptionUnsupported { msg: msg.into() }
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown {
            msg: msg.into(),
            cause: None,
        }
    }

    pub fn unknown_caused(msg: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Unknown {
            msg: msg.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Failure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_failure_displays_code_and_message() {
        let failure = Failure::Wallet(NwcError::new("INSUFFICIENT_BALANCE", "not enough sats"));
        assert_eq!(
            failure.to_string(),
            "wallet error [INSUFFICIENT_BALANCE]: not enough sats"
        );
    }

    #[test]
    fn error_envelope_message_defaults_to_empty() {
        let err: NwcError = serde_json::from_str(r#"{"code":"RESTRICTED"}"#).unwrap();
        assert_eq!(err.code, "RESTRICTED");
        assert_eq!(err.message, "");
    }
}
