//! Nostr Wallet Connect (NIP-47) client engine
//!
//! A request/response and notification engine layered over Nostr relays:
//! typed wallet operations (pay_invoice, make_invoice, list_transactions,
//! ...) are signed, end-to-end encrypted and dispatched across every relay
//! of the connection; responses are correlated back by request event id and
//! wallet push notifications are decoded into a broadcast stream.
//!
//! Entry point is [`NwcClient`], built from a `nostr+walletconnect://` URI
//! via [`Credentials`]. Every operation exists in a suspending form bounded
//! by a deadline and an observable `*_request` form returning a
//! [`RequestHandle`] whose state moves from Loading to Success or Failure.

pub mod core;
pub mod nwc;

pub use crate::core::config::ClientConfig;
pub use crate::core::credentials::Credentials;
pub use crate::core::error::{Failure, NwcError, Result};
pub use crate::nwc::client::NwcClient;
pub use crate::nwc::crypto::EncryptionScheme;
pub use crate::nwc::handle::RequestHandle;
pub use crate::nwc::notifications::WalletNotification;
pub use crate::nwc::session::{ConnectionSnapshot, ConnectionState, RelaySession, SessionProvider};
pub use crate::nwc::types::{
    Capability, GetInfoResult, ListTransactionsParams, LookupInvoiceParams, MakeInvoiceParams,
    Method, MultiPayInvoiceEntry, MultiPayKeysendEntry, MultiResult, Network, NotificationKind,
    PayInvoiceParams, PayKeysendParams, PayResult, RequestState, TlvRecord, Transaction,
    TransactionDirection, TransactionState, WalletDescriptor, WalletMetadata,
};
