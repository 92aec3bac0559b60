//! Core module - errors, configuration and connection credentials

pub mod config;
pub mod credentials;
pub mod error;

pub use config::ClientConfig;
pub use credentials::Credentials;
pub use error::{Failure, NwcError, Result};
