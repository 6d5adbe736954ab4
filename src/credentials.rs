//! Bearer token sources.
//!
//! The host's auth layer owns login and refresh; it writes the current token
//! into the OS credential store (Keychain, DPAPI, Secret Service) and the
//! API client reads it back per request.

use keyring::Entry;
use tracing::warn;
use zeroize::Zeroizing;

use crate::api::TokenProvider;

const SERVICE_NAME: &str = "repair-minder";
const KEY_API_TOKEN: &str = "api_token";

#[derive(Debug, thiserror::Error)]
#[error("credential store: {0}")]
pub struct CredentialError(#[from] keyring::Error);

/// Token kept in the OS keyring under `repair-minder/api_token` (or a
/// custom service name for multi-account hosts).
#[derive(Debug, Clone)]
pub struct KeyringTokenStore {
    service: String,
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl KeyringTokenStore {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry, CredentialError> {
        Ok(Entry::new(&self.service, KEY_API_TOKEN)?)
    }

    /// Returns `None` when no token is stored.
    pub fn get(&self) -> Result<Option<Zeroizing<String>>, CredentialError> {
        match self.entry()?.get_password() {
            Ok(token) => Ok(Some(Zeroizing::new(token))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set(&self, token: &str) -> Result<(), CredentialError> {
        self.entry()?.set_password(token)?;
        Ok(())
    }

    /// Silently succeeds if nothing is stored.
    pub fn delete(&self) -> Result<(), CredentialError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl TokenProvider for KeyringTokenStore {
    fn bearer_token(&self) -> Option<Zeroizing<String>> {
        match self.get() {
            Ok(token) => token.filter(|t| !t.trim().is_empty()),
            Err(e) => {
                warn!(error = %e, "failed to read API token");
                None
            }
        }
    }
}

/// Fixed token, for hosts that manage the secret themselves.
pub struct StaticToken(Zeroizing<String>);

impl StaticToken {
    pub fn new(token: &str) -> Self {
        Self(Zeroizing::new(token.to_string()))
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<Zeroizing<String>> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.clone())
        }
    }
}
