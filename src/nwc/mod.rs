//! NWC module - the NIP-47 wallet client engine

pub mod client;
pub mod codec;
pub mod crypto;
pub mod engine;
pub mod handle;
pub mod init;
pub mod notifications;
pub mod pending;
pub mod relay;
pub mod router;
pub mod session;
pub mod types;

pub use client::NwcClient;
pub use crypto::EncryptionScheme;
pub use handle::RequestHandle;
pub use init::InitState;
pub use notifications::WalletNotification;
pub use relay::RelayManager;
pub use session::{ConnectionSnapshot, ConnectionState, RelaySession, SessionProvider};
pub use types::{
    Capability, GetInfoResult, ListTransactionsParams, LookupInvoiceParams, MakeInvoiceParams,
    Method, MultiPayInvoiceEntry, MultiPayKeysendEntry, MultiResult, Network, NotificationKind,
    PayInvoiceParams, PayKeysendParams, PayResult, RequestState, TlvRecord, Transaction,
    TransactionDirection, TransactionState, WalletDescriptor, WalletMetadata,
};
