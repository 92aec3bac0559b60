//! NWC data model - methods, transactions, wallet metadata and
//! request/response payloads
//!
//! All amounts are millisatoshis. Payload fields that are schema-less on
//! the wire stay `serde_json::Value` so metadata round-trips verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{Failure, NwcError, Result};
use crate::nwc::crypto::EncryptionScheme;

/// NIP-47 request methods supported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GetBalance,
    GetInfo,
    PayInvoice,
    MultiPayInvoice,
    PayKeysend,
    MultiPayKeysend,
    MakeInvoice,
    LookupInvoice,
    ListTransactions,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetBalance => "get_balance",
            Method::GetInfo => "get_info",
            Method::PayInvoice => "pay_invoice",
            Method::MultiPayInvoice => "multi_pay_invoice",
            Method::PayKeysend => "pay_keysend",
            Method::MultiPayKeysend => "multi_pay_keysend",
            Method::MakeInvoice => "make_invoice",
            Method::LookupInvoice => "lookup_invoice",
            Method::ListTransactions => "list_transactions",
        }
    }

    pub fn parse(s: &str) -> Option<Method> {
        match s {
            "get_balance" => Some(Method::GetBalance),
            "get_info" => Some(Method::GetInfo),
            "pay_invoice" => Some(Method::PayInvoice),
            "multi_pay_invoice" => Some(Method::MultiPayInvoice),
            "pay_keysend" => Some(Method::PayKeysend),
            "multi_pay_keysend" => Some(Method::MultiPayKeysend),
            "make_invoice" => Some(Method::MakeInvoice),
            "lookup_invoice" => Some(Method::LookupInvoice),
            "list_transactions" => Some(Method::ListTransactions),
            _ => None,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a lightning transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionDirection {
    Incoming,
    Outgoing,
}

impl TransactionDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionDirection::Incoming => "incoming",
            TransactionDirection::Outgoing => "outgoing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incoming" => Some(TransactionDirection::Incoming),
            "outgoing" => Some(TransactionDirection::Outgoing),
            _ => None,
        }
    }
}

/// Settlement state of a transaction. Unrecognized wire values parse to
/// `None` on the transaction rather than failing the whole payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Pending,
    Settled,
    Expired,
    Failed,
}

impl TransactionState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionState::Pending),
            "settled" => Some(TransactionState::Settled),
            "expired" => Some(TransactionState::Expired),
            "failed" => Some(TransactionState::Failed),
            _ => None,
        }
    }
}

/// A wallet transaction as reported by `list_transactions`,
/// `lookup_invoice`, `make_invoice` and payment notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub direction: TransactionDirection,
    pub state: Option<TransactionState>,
    pub invoice: Option<String>,
    pub description: Option<String>,
    pub description_hash: Option<String>,
    pub preimage: Option<String>,
    pub payment_hash: String,
    pub amount_msats: u64,
    pub fees_paid_msats: Option<u64>,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub settled_at: Option<u64>,
    /// Opaque wallet metadata, passed through verbatim.
    pub metadata: Option<Value>,
}

/// Wallet capability advertised in the kind 13194 info event.
/// `Unknown` keeps forward-compatible tokens intact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    GetBalance,
    GetInfo,
    PayInvoice,
    MultiPayInvoice,
    PayKeysend,
    MultiPayKeysend,
    MakeInvoice,
    LookupInvoice,
    ListTransactions,
    Notifications,
    Unknown(String),
}

impl Capability {
    pub fn parse(token: &str) -> Self {
        match token {
            "get_balance" => Capability::GetBalance,
            "get_info" => Capability::GetInfo,
            "pay_invoice" => Capability::PayInvoice,
            "multi_pay_invoice" => Capability::MultiPayInvoice,
            "pay_keysend" => Capability::PayKeysend,
            "multi_pay_keysend" => Capability::MultiPayKeysend,
            "make_invoice" => Capability::MakeInvoice,
            "lookup_invoice" => Capability::LookupInvoice,
            "list_transactions" => Capability::ListTransactions,
            "notifications" => Capability::Notifications,
            other => Capability::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Capability::GetBalance => "get_balance",
            Capability::GetInfo => "get_info",
            Capability::PayInvoice => "pay_invoice",
            Capability::MultiPayInvoice => "multi_pay_invoice",
            Capability::PayKeysend => "pay_keysend",
            Capability::MultiPayKeysend => "multi_pay_keysend",
            Capability::MakeInvoice => "make_invoice",
            Capability::LookupInvoice => "lookup_invoice",
            Capability::ListTransactions => "list_transactions",
            Capability::Notifications => "notifications",
            Capability::Unknown(token) => token,
        }
    }
}

/// Notification types the wallet can push. Forward compatible.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    PaymentReceived,
    PaymentSent,
    Unknown(String),
}

impl NotificationKind {
    pub fn parse(token: &str) -> Self {
        match token {
            "payment_received" => NotificationKind::PaymentReceived,
            "payment_sent" => NotificationKind::PaymentSent,
            other => NotificationKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::PaymentReceived => "payment_received",
            NotificationKind::PaymentSent => "payment_sent",
            NotificationKind::Unknown(token) => token,
        }
    }
}

/// Parsed kind 13194 wallet info event.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletMetadata {
    pub capabilities: Vec<Capability>,
    pub encryption: Vec<EncryptionScheme>,
    pub notifications: Vec<NotificationKind>,
    /// True when the info event carried no `encryption` tag at all; NIP-47
    /// then defaults the conversation to NIP-04.
    pub defaulted_to_nip04: bool,
}

/// Bitcoin network reported by `get_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
    Unknown,
}

impl Network {
    pub fn parse(s: &str) -> Self {
        match s {
            "mainnet" => Network::Mainnet,
            "testnet" => Network::Testnet,
            "signet" => Network::Signet,
            "regtest" => Network::Regtest,
            _ => Network::Unknown,
        }
    }
}

/// `get_info` result.
#[derive(Debug, Clone, PartialEq)]
pub struct GetInfoResult {
    pub alias: Option<String>,
    pub color: Option<String>,
    pub pubkey: Option<String>,
    pub network: Network,
    pub block_height: Option<u64>,
    pub block_hash: Option<String>,
    pub capabilities: Vec<Capability>,
    pub notifications: Vec<NotificationKind>,
}

/// Merged view of everything the client knows about the wallet.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletDescriptor {
    /// Canonical connection URI derived from the credentials.
    pub uri: String,
    pub metadata: WalletMetadata,
    pub info: GetInfoResult,
    /// The scheme currently used to encrypt outgoing requests.
    pub encryption: EncryptionScheme,
}

/// Decrypted response envelope prior to per-method decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub result_type: String,
    pub result: Option<Value>,
    pub error: Option<NwcError>,
}

/// Per-item outcome of a multi request.
pub type MultiResult<T> = std::result::Result<T, NwcError>;

/// Observable request lifecycle. Unlike `Result` this includes the
/// pre-terminal `Loading` state surfaced to state subscribers.
#[derive(Debug, Clone)]
pub enum RequestState<T> {
    Loading,
    Success(T),
    Failure(Failure),
}

impl<T> RequestState<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, RequestState::Loading)
    }

    /// Terminal state as a `Result`; `None` while still loading.
    pub fn into_result(self) -> Option<Result<T>> {
        match self {
            RequestState::Loading => None,
            RequestState::Success(value) => Some(Ok(value)),
            RequestState::Failure(failure) => Some(Err(failure)),
        }
    }
}

/// `pay_invoice` parameters.
#[derive(Debug, Clone, Serialize)]
pub struct PayInvoiceParams {
    pub invoice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl PayInvoiceParams {
    pub fn new(invoice: impl Into<String>) -> Self {
        Self {
            invoice: invoice.into(),
            amount: None,
            metadata: None,
        }
    }
}

/// One entry of a `multi_pay_invoice` batch. An omitted `id` is filled in
/// with a random 8-byte hex identifier at dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct MultiPayInvoiceEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub invoice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A keysend custom record; `value` is hex-encoded.
#[derive(Debug, Clone, Serialize)]
pub struct TlvRecord {
    #[serde(rename = "type")]
    pub tlv_type: u64,
    pub value: String,
}

/// `pay_keysend` parameters.
#[derive(Debug, Clone, Serialize)]
pub struct PayKeysendParams {
    pub pubkey: String,
    pub amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tlv_records: Vec<TlvRecord>,
}

/// One entry of a `multi_pay_keysend` batch.
#[derive(Debug, Clone, Serialize)]
pub struct MultiPayKeysendEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub pubkey: String,
    pub amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tlv_records: Vec<TlvRecord>,
}

/// `make_invoice` parameters.
#[derive(Debug, Clone, Serialize)]
pub struct MakeInvoiceParams {
    pub amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// `lookup_invoice` parameters; at least one selector must be set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LookupInvoiceParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
}

/// `list_transactions` parameters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListTransactionsParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    pub unpaid: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<TransactionDirection>,
}

/// `pay_invoice` / `pay_keysend` result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PayResult {
    pub preimage: String,
    #[serde(default)]
    pub fees_paid: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_round_trip() {
        for method in [
            Method::GetBalance,
            Method::GetInfo,
            Method::PayInvoice,
            Method::MultiPayInvoice,
            Method::PayKeysend,
            Method::MultiPayKeysend,
            Method::MakeInvoice,
            Method::LookupInvoice,
            Method::ListTransactions,
        ] {
            assert_eq!(Method::parse(method.as_str()), Some(method));
        }
        assert_eq!(Method::parse("mint_cashu"), None);
    }

    #[test]
    fn unknown_capability_token_is_retained() {
        let capability = Capability::parse("create_connection");
        assert_eq!(
            capability,
            Capability::Unknown("create_connection".to_string())
        );
        assert_eq!(capability.as_str(), "create_connection");
    }

    #[test]
    fn optional_params_are_omitted_from_the_wire() {
        let params = PayInvoiceParams::new("lnbc1invoice");
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"invoice":"lnbc1invoice"}"#);
    }

    #[test]
    fn unpaid_flag_is_always_serialized() {
        let params = ListTransactionsParams::default();
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json, serde_json::json!({ "unpaid": false }));
    }

    #[test]
    fn tlv_record_uses_wire_field_names() {
        let record = TlvRecord {
            tlv_type: 5482373484,
            value: "deadbeef".to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": 5482373484u64, "value": "deadbeef" })
        );
    }
}
