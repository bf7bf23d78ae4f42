//! Credential source consulted before every sync request.
//!
//! Token lifecycle (sign-in, refresh) belongs to the host application; the
//! sync engine only asks for the current bearer token.

use std::fmt;
use std::sync::{Arc, RwLock};

pub trait CredentialSource: Send + Sync {
    /// Current bearer token; `None` means the session expired
    fn access_token(&self) -> Option<String>;
}

/// Token held in memory and replaced by the host after re-authentication
#[derive(Clone, Default)]
pub struct StaticCredentials {
    token: Arc<RwLock<Option<String>>>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        let token = token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        Self {
            token: Arc::new(RwLock::new(token)),
        }
    }

    pub fn set(&self, token: Option<String>) {
        let token = token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        match self.token.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    pub fn clear(&self) {
        self.set(None);
    }
}

impl CredentialSource for StaticCredentials {
    fn access_token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StaticCredentials")
            .field(
                "token",
                &self.access_token().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}
