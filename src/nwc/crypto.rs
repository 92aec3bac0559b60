//! Encryption layer and scheme negotiation
//!
//! NIP-44 v2 is preferred, NIP-04 is the NIP-47 default fallback. The cipher
//! is stateless: both the NIP-44 conversation key and the NIP-04 shared
//! secret derive from the (client secret, wallet pubkey) pair it owns.

use nostr_sdk::nips::{nip04, nip44};
use nostr_sdk::prelude::*;

use crate::core::error::{Failure, Result};
use crate::nwc::codec::first_tag_value;
use crate::nwc::types::WalletMetadata;

/// Tag name carrying the encryption scheme on request/response events.
pub const ENCRYPTION_TAG: &str = "encryption";

/// NIP-47 encryption schemes. `Unknown` survives parsing for forward
/// compatibility but is never selected as the active scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EncryptionScheme {
    Nip44V2,
    Nip04,
    Unknown(String),
}

/// Preference order applied during negotiation.
pub const SCHEME_PREFERENCE: [EncryptionScheme; 2] =
    [EncryptionScheme::Nip44V2, EncryptionScheme::Nip04];

impl EncryptionScheme {
    pub fn parse(token: &str) -> Self {
        match token {
            "nip44_v2" => EncryptionScheme::Nip44V2,
            "nip04" => EncryptionScheme::Nip04,
            other => EncryptionScheme::Unknown(other.to_string()),
        }
    }

    /// Wire name used in `encryption` tags.
    pub fn as_str(&self) -> &str {
        match self {
            EncryptionScheme::Nip44V2 => "nip44_v2",
            EncryptionScheme::Nip04 => "nip04",
            EncryptionScheme::Unknown(token) => token,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EncryptionScheme::Unknown(_))
    }
}

impl std::fmt::Display for EncryptionScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateless cipher over the client secret / wallet pubkey pair. Dropped
/// together with the client, which releases the key material.
#[derive(Clone)]
pub struct WalletCipher {
    secret: SecretKey,
    wallet_pubkey: PublicKey,
}

impl WalletCipher {
    pub fn new(secret: SecretKey, wallet_pubkey: PublicKey) -> Self {
        Self {
            secret,
            wallet_pubkey,
        }
    }

    pub fn encrypt(&self, plaintext: &str, scheme: &EncryptionScheme) -> Result<String> {
        match scheme {
            EncryptionScheme::Nip44V2 => nip44::encrypt(
                &self.secret,
                &self.wallet_pubkey,
                plaintext,
                nip44::Version::V2,
            )
            .map_err(|e| Failure::unknown_caused("NIP-44 encryption failed", e.to_string())),
            EncryptionScheme::Nip04 => {
                nip04::encrypt(&self.secret, &self.wallet_pubkey, plaintext)
                    .map_err(|e| Failure::unknown_caused("NIP-04 encryption failed", e.to_string()))
            }
            EncryptionScheme::Unknown(token) => Err(Failure::encryption(format!(
                "cannot encrypt with unsupported scheme {token}"
            ))),
        }
    }

    pub fn decrypt(&self, ciphertext: &str, scheme: &EncryptionScheme) -> Result<String> {
        match scheme {
            EncryptionScheme::Nip44V2 => {
                nip44::decrypt(&self.secret, &self.wallet_pubkey, ciphertext)
                    .map_err(|e| Failure::unknown_caused("NIP-44 decryption failed", e.to_string()))
            }
            EncryptionScheme::Nip04 => {
                nip04::decrypt(&self.secret, &self.wallet_pubkey, ciphertext)
                    .map_err(|e| Failure::unknown_caused("NIP-04 decryption failed", e.to_string()))
            }
            EncryptionScheme::Unknown(token) => Err(Failure::encryption(format!(
                "cannot decrypt with unsupported scheme {token}"
            ))),
        }
    }
}

/// Selects the scheme used to encrypt outgoing requests.
///
/// Advertised `Unknown` schemes are ignored. An empty candidate set is only
/// acceptable when the info event omitted the `encryption` tag entirely, in
/// which case the NIP-47 default of NIP-04 applies.
pub fn select_scheme(metadata: &WalletMetadata) -> Result<EncryptionScheme> {
    let candidates: Vec<EncryptionScheme> = metadata
        .encryption
        .iter()
        .filter(|scheme| scheme.is_known())
        .cloned()
        .collect();

    if candidates.is_empty() {
        if metadata.defaulted_to_nip04 {
            return Ok(EncryptionScheme::Nip04);
        }
        return Err(Failure::encryption(
            "wallet advertises no supported encryption scheme",
        ));
    }

    for preferred in &SCHEME_PREFERENCE {
        if candidates.contains(preferred) {
            return Ok(preferred.clone());
        }
    }
    Ok(candidates[0].clone())
}

/// Scheme used to decrypt an inbound event. The event's `encryption` tag is
/// authoritative when it names a supported scheme; otherwise the active
/// scheme is inferred. Returns the scheme and whether it came from the tag.
pub fn scheme_for_event(event: &Event, active: &EncryptionScheme) -> (EncryptionScheme, bool) {
    if let Some(value) = first_tag_value(event, ENCRYPTION_TAG) {
        let scheme = EncryptionScheme::parse(value.trim());
        if scheme.is_known() {
            return (scheme, true);
        }
    }
    (active.clone(), false)
}

/// Decrypts an inbound event with the one-shot NIP-04 fallback: when the
/// scheme was inferred (no tag) and the wallet advertises NIP-04, a failed
/// decrypt is retried once with NIP-04. The original failure propagates if
/// the retry also fails.
pub fn decrypt_event(
    cipher: &WalletCipher,
    event: &Event,
    active: &EncryptionScheme,
    metadata: Option<&WalletMetadata>,
) -> Result<String> {
    let (scheme, from_tag) = scheme_for_event(event, active);
    match cipher.decrypt(&event.content, &scheme) {
        Ok(plaintext) => Ok(plaintext),
        Err(original) => {
            let nip04_advertised = metadata
                .map(|m| m.encryption.contains(&EncryptionScheme::Nip04) || m.defaulted_to_nip04)
                .unwrap_or(false);
            if !from_tag && scheme != EncryptionScheme::Nip04 && nip04_advertised {
                if let Ok(plaintext) = cipher.decrypt(&event.content, &EncryptionScheme::Nip04) {
                    tracing::debug!(
                        "decrypted event {} with NIP-04 fallback after {scheme} failed",
                        event.id
                    );
                    return Ok(plaintext);
                }
            }
            Err(original)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nwc::types::WalletMetadata;

    fn metadata(encryption: Vec<EncryptionScheme>, defaulted: bool) -> WalletMetadata {
        WalletMetadata {
            capabilities: Vec::new(),
            encryption,
            notifications: Vec::new(),
            defaulted_to_nip04: defaulted,
        }
    }

    #[test]
    fn prefers_nip44_when_advertised() {
        let meta = metadata(
            vec![EncryptionScheme::Nip04, EncryptionScheme::Nip44V2],
            false,
        );
        assert_eq!(select_scheme(&meta).unwrap(), EncryptionScheme::Nip44V2);
    }

    #[test]
    fn falls_back_to_nip04_when_nip44_absent() {
        let meta = metadata(vec![EncryptionScheme::Nip04], false);
        assert_eq!(select_scheme(&meta).unwrap(), EncryptionScheme::Nip04);
    }

    #[test]
    fn empty_set_with_default_flag_selects_nip04() {
        let meta = metadata(Vec::new(), true);
        assert_eq!(select_scheme(&meta).unwrap(), EncryptionScheme::Nip04);
    }

    #[test]
    fn unknown_only_set_is_rejected() {
        let meta = metadata(
            vec![EncryptionScheme::Unknown("nip99_v7".to_string())],
            false,
        );
        assert!(matches!(
            select_scheme(&meta),
            Err(Failure::EncryptionUnsupported { .. })
        ));
    }

    #[test]
    fn empty_set_without_default_flag_is_rejected() {
        let meta = metadata(Vec::new(), false);
        assert!(matches!(
            select_scheme(&meta),
            Err(Failure::EncryptionUnsupported { .. })
        ));
    }

    #[test]
    fn cipher_round_trips_both_schemes() {
        let client = Keys::generate();
        let wallet = Keys::generate();
        let outbound = WalletCipher::new(client.secret_key().clone(), wallet.public_key());
        let inbound = WalletCipher::new(wallet.secret_key().clone(), client.public_key());

        for scheme in [EncryptionScheme::Nip44V2, EncryptionScheme::Nip04] {
            let ciphertext = outbound.encrypt("{\"method\":\"get_balance\"}", &scheme).unwrap();
            let plaintext = inbound.decrypt(&ciphertext, &scheme).unwrap();
            assert_eq!(plaintext, "{\"method\":\"get_balance\"}");
        }
    }

    #[test]
    fn unknown_scheme_cannot_encrypt() {
        let keys = Keys::generate();
        let cipher = WalletCipher::new(keys.secret_key().clone(), keys.public_key());
        let result = cipher.encrypt("hello", &EncryptionScheme::Unknown("nip99".to_string()));
        assert!(matches!(
            result,
            Err(Failure::EncryptionUnsupported { .. })
        ));
    }
}
