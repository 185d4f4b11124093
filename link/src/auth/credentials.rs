//! Credential capability consumed by the engine.
//!
//! The engine never stores, refreshes or persists tokens. It asks a
//! [`CredentialStore`] for the current token whenever it is about to open a
//! connection, and the [`AuthTokenMonitor`](crate::AuthTokenMonitor) polls
//! it to notice sign-in and sign-out.

use crate::error::{Result, TriageLinkError};
use base64::{engine::general_purpose, Engine as _};
use parking_lot::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds a JWT may be past its `exp` before it is treated as expired.
const CLOCK_SKEW_SECS: u64 = 30;

/// Source of the current bearer token.
///
/// Any `Fn() -> Option<String>` closure is a credential store:
///
/// ```rust
/// use std::sync::Arc;
/// use triage_link::CredentialStore;
///
/// let store: Arc<dyn CredentialStore> = Arc::new(|| std::env::var("TRIAGE_TOKEN").ok());
/// ```
pub trait CredentialStore: Send + Sync {
    /// Current token, or `None` when signed out. Empty strings count as
    /// absent.
    fn get_token(&self) -> Option<String>;
}

impl<F> CredentialStore for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn get_token(&self) -> Option<String> {
        self()
    }
}

/// In-memory credential store for tests and embedders that push tokens in.
///
/// # Example
///
/// ```rust
/// use triage_link::{CredentialStore, MemoryCredentialStore};
///
/// let store = MemoryCredentialStore::new();
/// assert_eq!(store.get_token(), None);
/// store.set_token("opaque-session-token");
/// assert_eq!(store.get_token().as_deref(), Some("opaque-session-token"));
/// store.clear();
/// assert_eq!(store.get_token(), None);
/// ```
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    token: RwLock<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

/// Local verdict on a token before dialing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Missing,
    Expired,
    /// Non-empty and, if it is a JWT with an `exp` claim, not expired
    Usable,
}

/// Current unix time in seconds.
fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Classify `token` against the wall clock.
pub fn token_status(token: Option<&str>) -> TokenStatus {
    token_status_at(token, now_secs())
}

pub(crate) fn token_status_at(token: Option<&str>, now_secs: u64) -> TokenStatus {
    let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
        return TokenStatus::Missing;
    };
    match jwt_expiry(token) {
        Some(exp) if exp.saturating_add(CLOCK_SKEW_SECS) <= now_secs => TokenStatus::Expired,
        _ => TokenStatus::Usable,
    }
}

/// Fetch a token that may be used to connect right now.
pub(crate) fn usable_token(store: &dyn CredentialStore) -> Result<String> {
    let token = store.get_token();
    match token_status(token.as_deref()) {
        TokenStatus::Usable => Ok(token.unwrap_or_default().trim().to_string()),
        TokenStatus::Missing => Err(TriageLinkError::AuthenticationError(
            "No credential available".to_string(),
        )),
        TokenStatus::Expired => Err(TriageLinkError::AuthenticationError(
            "Credential has expired".to_string(),
        )),
    }
}

/// `exp` claim of a JWT, if `token` is one.
///
/// The signature is not checked; only the server decides validity.
fn jwt_expiry(token: &str) -> Option<u64> {
    let mut parts = token.split('.');
    let (_header, claims, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let decoded = general_purpose::URL_SAFE_NO_PAD
        .decode(claims.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?;
    exp.as_u64().or_else(|| exp.as_f64().map(|f| f.max(0.0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn jwt_with(claims: serde_json::Value) -> String {
        let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = general_purpose::URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.signature", header, body)
    }

    #[test]
    fn test_missing_and_empty_tokens() {
        assert_eq!(token_status_at(None, 0), TokenStatus::Missing);
        assert_eq!(token_status_at(Some(""), 0), TokenStatus::Missing);
        assert_eq!(token_status_at(Some("   "), 0), TokenStatus::Missing);
    }

    #[test]
    fn test_opaque_token_is_usable() {
        assert_eq!(token_status_at(Some("sess_4f1c2a"), 1_700_000_000), TokenStatus::Usable);
    }

    #[test]
    fn test_jwt_expiry_with_skew() {
        let token = jwt_with(json!({"sub": "u-1", "exp": 1_000}));
        assert_eq!(token_status_at(Some(&token), 900), TokenStatus::Usable);
        assert_eq!(token_status_at(Some(&token), 1_010), TokenStatus::Usable);
        assert_eq!(token_status_at(Some(&token), 1_030), TokenStatus::Expired);
    }

    #[test]
    fn test_jwt_without_exp_is_usable() {
        let token = jwt_with(json!({"sub": "u-1"}));
        assert_eq!(token_status_at(Some(&token), u64::MAX), TokenStatus::Usable);
    }

    #[test]
    fn test_usable_token_errors_are_auth_errors() {
        let store = MemoryCredentialStore::new();
        assert!(usable_token(&store).unwrap_err().is_auth_error());

        store.set_token(jwt_with(json!({"exp": 1})));
        assert!(usable_token(&store).unwrap_err().is_auth_error());

        store.set_token("opaque");
        assert_eq!(usable_token(&store).unwrap(), "opaque");
    }

    #[test]
    fn test_closure_store() {
        let store = || Some("from-closure".to_string());
        assert_eq!(usable_token(&store).unwrap(), "from-closure");
        let empty = || Some(String::new());
        assert!(usable_token(&empty).is_err());
    }
}
