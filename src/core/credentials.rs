//! Wallet connection credentials
//!
//! Parses and renders the `nostr+walletconnect://` connection URI (NIP-47):
//! wallet pubkey, one or more relays, the client secret and an optional
//! lightning address.

use nostr_sdk::prelude::*;

use crate::core::error::{Failure, Result};

/// URI scheme for NWC connection strings. Matching is case-insensitive.
pub const URI_SCHEME: &str = "nostr+walletconnect";

/// Parsed NWC connection credentials. Immutable for the client's lifetime.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Public key of the wallet service (32-byte hex).
    pub wallet_pubkey: PublicKey,
    /// Relay URLs, in URI order, trimmed and deduplicated. Never empty.
    pub relays: Vec<String>,
    /// Client secret key used to sign and encrypt requests.
    pub secret: SecretKey,
    /// Optional lightning address advertised by the wallet.
    pub lud16: Option<String>,
}

impl Credentials {
    pub fn new(
        wallet_pubkey: PublicKey,
        relays: Vec<String>,
        secret: SecretKey,
        lud16: Option<String>,
    ) -> Result<Self> {
        let relays = normalize_relays(relays);
        if relays.is_empty() {
            return Err(Failure::protocol("at least one relay is required"));
        }
        Ok(Self {
            wallet_pubkey,
            relays,
            secret,
            lud16,
        })
    }

    /// Parses a `nostr+walletconnect://pubkey?relay=...&secret=...` URI.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let uri = uri.trim();

        let without_scheme = strip_scheme(uri)
            .ok_or_else(|| Failure::protocol("invalid NWC URI scheme"))?;

        // Split into pubkey and query string
        let (pubkey_str, query) = without_scheme
            .split_once('?')
            .ok_or_else(|| Failure::protocol("missing query parameters in NWC URI"))?;

        let wallet_pubkey = PublicKey::from_hex(pubkey_str)
            .map_err(|e| Failure::protocol(format!("invalid pubkey in NWC URI: {e}")))?;

        let mut relays = Vec::new();
        let mut secret_str = None;
        let mut lud16 = None;

        for param in query.split('&') {
            if let Some((key, value)) = param.split_once('=') {
                match key {
                    "relay" => {
                        let decoded = urlencoding::decode(value).map_err(|e| {
                            Failure::protocol(format!("failed to decode relay URL: {e}"))
                        })?;
                        relays.push(decoded.to_string());
                    }
                    "secret" => secret_str = Some(value.to_string()),
                    "lud16" => {
                        let decoded = urlencoding::decode(value).map_err(|e| {
                            Failure::protocol(format!("failed to decode lud16: {e}"))
                        })?;
                        lud16 = Some(decoded.to_string());
                    }
                    _ => {}
                }
            }
        }

        let secret_str =
            secret_str.ok_or_else(|| Failure::protocol("missing secret in NWC URI"))?;
        let secret = SecretKey::from_hex(&secret_str)
            .map_err(|e| Failure::protocol(format!("invalid secret in NWC URI: {e}")))?;

        Self::new(wallet_pubkey, relays, secret, lud16)
    }

    /// Renders the canonical connection URI for these credentials.
    pub fn to_uri(&self) -> String {
        let mut uri = format!("{}://{}", URI_SCHEME, self.wallet_pubkey.to_hex());
        let mut separator = '?';
        for relay in &self.relays {
            uri.push(separator);
            separator = '&';
            uri.push_str("relay=");
            uri.push_str(&urlencoding::encode(relay));
        }
        uri.push(separator);
        uri.push_str("secret=");
        uri.push_str(&self.secret.to_secret_hex());
        if let Some(lud16) = &self.lud16 {
            uri.push_str("&lud16=");
            uri.push_str(&urlencoding::encode(lud16));
        }
        uri
    }

    /// Signing keys derived from the client secret.
    pub fn client_keys(&self) -> Keys {
        Keys::new(self.secret.clone())
    }

    /// The client's public key (the `p` tag wallets put on responses).
    pub fn client_pubkey(&self) -> PublicKey {
        self.client_keys().public_key()
    }
}

fn strip_scheme(uri: &str) -> Option<&str> {
    let prefix_len = URI_SCHEME.len() + "://".len();
    if uri.len() < prefix_len || !uri.is_char_boundary(prefix_len) {
        return None;
    }
    let (scheme, rest) = uri.split_at(prefix_len);
    if scheme.eq_ignore_ascii_case(&format!("{URI_SCHEME}://")) {
        Some(rest)
    } else {
        None
    }
}

fn normalize_relays(relays: Vec<String>) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(relays.len());
    for relay in relays {
        let trimmed = relay.trim().to_string();
        if trimmed.is_empty() || normalized.contains(&trimmed) {
            continue;
        }
        normalized.push(trimmed);
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET_PUBKEY: &str =
        "b889ff5b1513b641e2a139f661a661364979c5beee91842f8f0ef42ab558e9d4";
    const SECRET: &str = "71a8c14c1407c113601079c4302dab36460f0ccd0ad506f1f2dc73b5100e4f3c";

    #[test]
    fn parses_full_uri() {
        let uri = format!(
            "nostr+walletconnect://{WALLET_PUBKEY}?relay=wss%3A%2F%2Frelay.damus.io\
             &relay=wss://example.com&secret={SECRET}&lud16=alice@example.com"
        );
        let credentials = Credentials::from_uri(&uri).unwrap();
        assert_eq!(credentials.wallet_pubkey.to_hex(), WALLET_PUBKEY);
        assert_eq!(
            credentials.relays,
            vec!["wss://relay.damus.io", "wss://example.com"]
        );
        assert_eq!(credentials.secret.to_secret_hex(), SECRET);
        assert_eq!(credentials.lud16.as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let uri = format!(
            "NOSTR+WALLETCONNECT://{WALLET_PUBKEY}?relay=wss://relay.damus.io&secret={SECRET}"
        );
        let credentials = Credentials::from_uri(&uri).unwrap();
        assert_eq!(credentials.relays, vec!["wss://relay.damus.io"]);
    }

    #[test]
    fn relays_are_trimmed_and_deduplicated_in_order() {
        let uri = format!(
            "nostr+walletconnect://{WALLET_PUBKEY}?relay=%20wss://a.example%20\
             &relay=wss://b.example&relay=wss://a.example&secret={SECRET}"
        );
        let credentials = Credentials::from_uri(&uri).unwrap();
        assert_eq!(credentials.relays, vec!["wss://a.example", "wss://b.example"]);
    }

    #[test]
    fn missing_secret_is_rejected() {
        let uri = format!("nostr+walletconnect://{WALLET_PUBKEY}?relay=wss://relay.damus.io");
        assert!(Credentials::from_uri(&uri).is_err());
    }

    #[test]
    fn missing_relay_is_rejected() {
        let uri = format!("nostr+walletconnect://{WALLET_PUBKEY}?secret={SECRET}");
        assert!(Credentials::from_uri(&uri).is_err());
    }

    #[test]
    fn uri_round_trips() {
        let uri = format!(
            "nostr+walletconnect://{WALLET_PUBKEY}?relay=wss%3A%2F%2Frelay.damus.io\
             &relay=wss://example.com&secret={SECRET}&lud16=alice@example.com"
        );
        let credentials = Credentials::from_uri(&uri).unwrap();
        let reparsed = Credentials::from_uri(&credentials.to_uri()).unwrap();
        assert_eq!(reparsed.wallet_pubkey, credentials.wallet_pubkey);
        assert_eq!(reparsed.relays, credentials.relays);
        assert_eq!(reparsed.secret.to_secret_hex(), credentials.secret.to_secret_hex());
        assert_eq!(reparsed.lud16, credentials.lud16);
    }
}
