//! Wire codec for NIP-47 payloads
//!
//! Serializes `{method, params}` request bodies and parses response
//! envelopes, transactions, notifications and the kind 13194 info event.

use nostr_sdk::prelude::*;
use serde_json::{json, Value};

use crate::core::error::{Failure, NwcError, Result};
use crate::nwc::crypto::{EncryptionScheme, ENCRYPTION_TAG};
use crate::nwc::notifications::WalletNotification;
use crate::nwc::types::{
    Capability, GetInfoResult, Method, Network, NotificationKind, PayResult, RawResponse,
    Transaction, TransactionDirection, TransactionState, WalletMetadata,
};

/// Nostr tag name carrying the wallet's notification types on the info event.
pub const NOTIFICATIONS_TAG: &str = "notifications";

/// First value of the first tag named `name`, by raw tag inspection.
pub fn first_tag_value(event: &Event, name: &str) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let slice = tag.as_slice();
        if slice.len() >= 2 && slice[0] == name {
            Some(slice[1].clone())
        } else {
            None
        }
    })
}

/// Serializes a request body to its canonical UTF-8 form. `serde_json`
/// emits no insignificant whitespace, so the encoding is deterministic.
pub fn serialize_request(method: Method, params: &Value) -> String {
    json!({ "method": method.as_str(), "params": params }).to_string()
}

/// Parses a decrypted response envelope `{result_type, result, error}`.
pub fn parse_response(content: &str) -> Result<RawResponse> {
    let value: Value = serde_json::from_str(content)
        .map_err(|e| Failure::protocol(format!("invalid response JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| Failure::protocol("response is not a JSON object"))?;

    let result_type = object
        .get("result_type")
        .and_then(Value::as_str)
        .ok_or_else(|| Failure::protocol("response missing result_type"))?
        .to_string();

    let error = parse_error_field(object.get("error"));
    let result = match object.get("result") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.clone()),
    };

    Ok(RawResponse {
        result_type,
        result,
        error,
    })
}

/// `null` or absent means no error; an object with a non-empty `code` is an
/// error, with the message defaulting to the empty string.
fn parse_error_field(value: Option<&Value>) -> Option<NwcError> {
    let object = value?.as_object()?;
    let code = object.get("code").and_then(Value::as_str)?;
    if code.is_empty() {
        return None;
    }
    let message = object
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(NwcError::new(code, message))
}

/// Parses a transaction object. `type`, `payment_hash`, `amount` and
/// `created_at` are required; an unrecognized `type` is a protocol error
/// while an unrecognized `state` degrades to `None`.
pub fn parse_transaction(value: &Value) -> Result<Transaction> {
    let object = value
        .as_object()
        .ok_or_else(|| Failure::protocol("transaction is not a JSON object"))?;

    let direction_token = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Failure::protocol("transaction missing type"))?;
    let direction = TransactionDirection::parse(direction_token).ok_or_else(|| {
        Failure::protocol(format!("unrecognized transaction type {direction_token}"))
    })?;

    let payment_hash = object
        .get("payment_hash")
        .and_then(Value::as_str)
        .ok_or_else(|| Failure::protocol("transaction missing payment_hash"))?
        .to_string();
    let amount_msats = object
        .get("amount")
        .and_then(Value::as_u64)
        .ok_or_else(|| Failure::protocol("transaction missing amount"))?;
    let created_at = object
        .get("created_at")
        .and_then(Value::as_u64)
        .ok_or_else(|| Failure::protocol("transaction missing created_at"))?;

    let state = object
        .get("state")
        .and_then(Value::as_str)
        .and_then(TransactionState::parse);

    Ok(Transaction {
        direction,
        state,
        invoice: string_field(object, "invoice"),
        description: string_field(object, "description"),
        description_hash: string_field(object, "description_hash"),
        preimage: string_field(object, "preimage"),
        payment_hash,
        amount_msats,
        fees_paid_msats: object.get("fees_paid").and_then(Value::as_u64),
        created_at,
        expires_at: object.get("expires_at").and_then(Value::as_u64),
        settled_at: object.get("settled_at").and_then(Value::as_u64),
        metadata: object.get("metadata").cloned(),
    })
}

fn string_field(object: &serde_json::Map<String, Value>, name: &str) -> Option<String> {
    object.get(name).and_then(Value::as_str).map(String::from)
}

/// Parses a kind 13194 wallet info event into metadata.
///
/// The content is a whitespace-separated capability list. The `encryption`
/// tag holds space-or-comma separated scheme tokens; when the tag is absent
/// the parser records `defaulted_to_nip04` and leaves the scheme set empty
/// so the negotiator applies the NIP-47 default. The `notifications` tag's
/// first value is a space-separated type list.
pub fn parse_info_event(event: &Event) -> WalletMetadata {
    let capabilities = event
        .content
        .split_whitespace()
        .map(Capability::parse)
        .collect();

    let (encryption, defaulted_to_nip04) = match first_tag_value(event, ENCRYPTION_TAG) {
        Some(value) => {
            let schemes = value
                .split([' ', ','])
                .filter(|token| !token.is_empty())
                .map(EncryptionScheme::parse)
                .collect();
            (schemes, false)
        }
        None => (Vec::new(), true),
    };

    let notifications = first_tag_value(event, NOTIFICATIONS_TAG)
        .map(|value| {
            value
                .split_whitespace()
                .map(NotificationKind::parse)
                .collect()
        })
        .unwrap_or_default();

    WalletMetadata {
        capabilities,
        encryption,
        notifications,
        defaulted_to_nip04,
    }
}

/// `get_balance` result: `{ balance: msats }`.
pub fn decode_balance(result: &Value) -> Result<u64> {
    result
        .get("balance")
        .and_then(Value::as_u64)
        .ok_or_else(|| Failure::protocol("get_balance result missing balance"))
}

/// `pay_invoice` / `pay_keysend` result: `{ preimage, fees_paid? }`.
pub fn decode_pay(result: &Value) -> Result<PayResult> {
    serde_json::from_value(result.clone())
        .map_err(|e| Failure::protocol(format!("malformed payment result: {e}")))
}

/// `get_info` result.
pub fn decode_get_info(result: &Value) -> Result<GetInfoResult> {
    let object = result
        .as_object()
        .ok_or_else(|| Failure::protocol("get_info result is not a JSON object"))?;

    let network = object
        .get("network")
        .and_then(Value::as_str)
        .map(Network::parse)
        .unwrap_or(Network::Unknown);

    let capabilities = object
        .get("methods")
        .and_then(Value::as_array)
        .map(|methods| {
            methods
                .iter()
                .filter_map(Value::as_str)
                .map(Capability::parse)
                .collect()
        })
        .unwrap_or_default();

    let notifications = object
        .get("notifications")
        .and_then(Value::as_array)
        .map(|kinds| {
            kinds
                .iter()
                .filter_map(Value::as_str)
                .map(NotificationKind::parse)
                .collect()
        })
        .unwrap_or_default();

    Ok(GetInfoResult {
        alias: string_field(object, "alias"),
        color: string_field(object, "color"),
        pubkey: string_field(object, "pubkey"),
        network,
        block_height: object.get("block_height").and_then(Value::as_u64),
        block_hash: string_field(object, "block_hash"),
        capabilities,
        notifications,
    })
}

/// `list_transactions` result: `{ transactions: [...] }`.
pub fn decode_transactions(result: &Value) -> Result<Vec<Transaction>> {
    result
        .get("transactions")
        .and_then(Value::as_array)
        .ok_or_else(|| Failure::protocol("list_transactions result missing transactions"))?
        .iter()
        .map(parse_transaction)
        .collect()
}

/// Parses a decrypted notification body `{notification_type, notification}`.
/// Unknown notification types are dropped (`Ok(None)`).
pub fn decode_notification(content: &str) -> Result<Option<WalletNotification>> {
    let value: Value = serde_json::from_str(content)
        .map_err(|e| Failure::protocol(format!("invalid notification JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| Failure::protocol("notification is not a JSON object"))?;

    let kind_token = object
        .get("notification_type")
        .and_then(Value::as_str)
        .ok_or_else(|| Failure::protocol("notification missing notification_type"))?;
    let payload = object
        .get("notification")
        .ok_or_else(|| Failure::protocol("notification missing payload"))?;

    match NotificationKind::parse(kind_token) {
        NotificationKind::PaymentReceived => {
            Ok(Some(WalletNotification::PaymentReceived(parse_transaction(
                payload,
            )?)))
        }
        NotificationKind::PaymentSent => Ok(Some(WalletNotification::PaymentSent(
            parse_transaction(payload)?,
        ))),
        NotificationKind::Unknown(token) => {
            tracing::debug!("dropping notification with unknown type {token}");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_event(content: &str, tags: Vec<Tag>) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::WalletConnectInfo, content)
            .tags(tags)
            .sign_with_keys(&keys)
            .unwrap()
    }

    #[test]
    fn request_serialization_is_compact() {
        let params = json!({ "invoice": "lnbc1invoice", "amount": 2500 });
        let body = serialize_request(Method::PayInvoice, &params);
        assert!(!body.contains(' '));
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["method"], "pay_invoice");
        assert_eq!(value["params"]["amount"], 2500);
    }

    #[test]
    fn response_requires_result_type() {
        assert!(matches!(
            parse_response(r#"{"result":{}}"#),
            Err(Failure::Protocol { .. })
        ));
        assert!(matches!(
            parse_response("[1,2,3]"),
            Err(Failure::Protocol { .. })
        ));
    }

    #[test]
    fn null_result_and_error_are_absent() {
        let raw =
            parse_response(r#"{"result_type":"get_balance","result":null,"error":null}"#).unwrap();
        assert_eq!(raw.result_type, "get_balance");
        assert!(raw.result.is_none());
        assert!(raw.error.is_none());
    }

    #[test]
    fn error_with_code_is_surfaced() {
        let raw = parse_response(
            r#"{"result_type":"pay_invoice","error":{"code":"INSUFFICIENT_BALANCE"}}"#,
        )
        .unwrap();
        let error = raw.error.unwrap();
        assert_eq!(error.code, "INSUFFICIENT_BALANCE");
        assert_eq!(error.message, "");
    }

    #[test]
    fn transaction_requires_core_fields() {
        let missing_hash = json!({
            "type": "incoming",
            "amount": 1000,
            "created_at": 1_700_000_000
        });
        assert!(parse_transaction(&missing_hash).is_err());

        let bad_type = json!({
            "type": "sideways",
            "payment_hash": "00ab",
            "amount": 1000,
            "created_at": 1_700_000_000
        });
        assert!(parse_transaction(&bad_type).is_err());
    }

    #[test]
    fn unknown_transaction_state_degrades_to_none() {
        let value = json!({
            "type": "outgoing",
            "state": "halfway",
            "payment_hash": "00ab",
            "amount": 21_000,
            "created_at": 1_700_000_000,
            "metadata": { "comment": "zap" }
        });
        let tx = parse_transaction(&value).unwrap();
        assert_eq!(tx.direction, TransactionDirection::Outgoing);
        assert!(tx.state.is_none());
        assert_eq!(tx.metadata, Some(json!({ "comment": "zap" })));
    }

    #[test]
    fn info_event_parses_capabilities_and_schemes() {
        let event = info_event(
            "pay_invoice get_balance mint_tokens",
            vec![
                Tag::custom(TagKind::custom(ENCRYPTION_TAG), ["nip44_v2   nip04"]),
                Tag::custom(
                    TagKind::custom(NOTIFICATIONS_TAG),
                    ["payment_received payment_sent"],
                ),
            ],
        );
        let metadata = parse_info_event(&event);
        assert_eq!(
            metadata.capabilities,
            vec![
                Capability::PayInvoice,
                Capability::GetBalance,
                Capability::Unknown("mint_tokens".to_string())
            ]
        );
        assert_eq!(
            metadata.encryption,
            vec![EncryptionScheme::Nip44V2, EncryptionScheme::Nip04]
        );
        assert_eq!(
            metadata.notifications,
            vec![
                NotificationKind::PaymentReceived,
                NotificationKind::PaymentSent
            ]
        );
        assert!(!metadata.defaulted_to_nip04);
    }

    #[test]
    fn info_event_without_encryption_tag_defaults_to_nip04() {
        let event = info_event("pay_invoice", Vec::new());
        let metadata = parse_info_event(&event);
        assert!(metadata.encryption.is_empty());
        assert!(metadata.defaulted_to_nip04);
        assert_eq!(
            crate::nwc::crypto::select_scheme(&metadata).unwrap(),
            EncryptionScheme::Nip04
        );
    }

    #[test]
    fn comma_separated_schemes_are_accepted() {
        let event = info_event(
            "pay_invoice",
            vec![Tag::custom(
                TagKind::custom(ENCRYPTION_TAG),
                ["nip44_v2,nip04"],
            )],
        );
        let metadata = parse_info_event(&event);
        assert_eq!(
            metadata.encryption,
            vec![EncryptionScheme::Nip44V2, EncryptionScheme::Nip04]
        );
    }

    #[test]
    fn notification_decoding_maps_types() {
        let body = json!({
            "notification_type": "payment_received",
            "notification": {
                "type": "incoming",
                "state": "settled",
                "payment_hash": "00ab",
                "amount": 5_000,
                "created_at": 1_700_000_000
            }
        })
        .to_string();
        let notification = decode_notification(&body).unwrap().unwrap();
        match notification {
            WalletNotification::PaymentReceived(tx) => {
                assert_eq!(tx.amount_msats, 5_000);
                assert_eq!(tx.state, Some(TransactionState::Settled));
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[test]
    fn unknown_notification_types_are_dropped() {
        let body = json!({
            "notification_type": "channel_opened",
            "notification": {}
        })
        .to_string();
        assert!(decode_notification(&body).unwrap().is_none());
    }
}
