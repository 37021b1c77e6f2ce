//! Credential acquisition.
//!
//! The login exchange itself is an external collaborator behind `LoginClient`.
//! `CredentialProvider` performs one exchange per call and caches the result in
//! memory; retry policy belongs to the caller.

/// Bearer credential type.
pub mod credential;
/// SOAP partner login.
pub mod soap;

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;

use crate::error::AuthError;

pub use credential::Credential;
pub use soap::SoapLogin;

/// Performs a login exchange and returns a bearer credential.
pub trait LoginClient: Send + Sync {
    /// Log in with username and password.
    fn login(&self, username: &str, password: &str) -> Result<Credential, AuthError>;
}

impl<F> LoginClient for F
where
    F: Fn(&str, &str) -> Result<Credential, AuthError> + Send + Sync,
{
    fn login(&self, username: &str, password: &str) -> Result<Credential, AuthError> {
        self(username, password)
    }
}

/// Obtains and caches bearer credentials.
pub struct CredentialProvider {
    login: Arc<dyn LoginClient>,
    cached: Mutex<Option<Credential>>,
}

impl std::fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("cached", &self.cached.lock().map(|c| c.is_some()).unwrap_or(false))
            .finish_non_exhaustive()
    }
}

impl CredentialProvider {
    pub fn new(login: Arc<dyn LoginClient>) -> Self {
        Self {
            login,
            cached: Mutex::new(None),
        }
    }

    /// Perform one login exchange and cache the resulting credential.
    pub fn obtain_token(&self, username: &str, password: &str) -> Result<Credential, AuthError> {
        let credential = self.login.login(username, password)?;
        debug!(instance_url = credential.instance_url(), "obtained bearer credential");
        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some(credential.clone());
        }
        Ok(credential)
    }

    /// Cached credential if still valid, otherwise a fresh one.
    pub fn token(&self, username: &str, password: &str) -> Result<Credential, AuthError> {
        if let Some(credential) = self.current() {
            if !credential.is_expired_at(Utc::now()) {
                return Ok(credential);
            }
        }
        self.obtain_token(username, password)
    }

    /// The cached credential, if any.
    #[must_use]
    pub fn current(&self) -> Option<Credential> {
        self.cached.lock().ok().and_then(|guard| guard.clone())
    }

    /// Forget the cached credential.
    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.cached.lock() {
            guard.take();
        }
    }
}
