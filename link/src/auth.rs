//! Credentials and the sign-in/sign-out watcher.
//!
//! The connection engine only reads tokens; it never stores or refreshes
//! them. [`AuthTokenMonitor`] turns token appearance and disappearance in a
//! [`CredentialStore`] into `connect()` / `disconnect()` calls.

mod credentials;
mod token_monitor;

pub use credentials::{token_status, CredentialStore, MemoryCredentialStore, TokenStatus};
pub(crate) use credentials::usable_token;
pub use token_monitor::AuthTokenMonitor;
