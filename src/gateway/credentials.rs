//! Bearer credential lifecycle: acquire, attach per request, invalidate on 401.

use std::sync::RwLock;

use tracing::{debug, warn};

/// Source of the bearer token attached to every backend request.
pub trait CredentialProvider: Send + Sync {
    /// Token to attach to the next request, if one is held.
    fn bearer_token(&self) -> Option<String>;

    /// Drop the held token after the backend rejected it.
    fn invalidate(&self);
}

/// Credential held in memory, acquired once from config or the environment.
#[derive(Debug, Default)]
pub struct StaticCredential {
    token: RwLock<Option<String>>,
}

impl StaticCredential {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.trim().is_empty())),
        }
    }

    /// Acquire from an inline value, falling back to the named environment variable.
    pub fn acquire(inline: Option<&str>, env_var: &str) -> Self {
        if let Some(token) = inline {
            debug!("using inline bearer credential");
            return Self::new(Some(token.to_string()));
        }
        match std::env::var(env_var) {
            Ok(token) => {
                debug!(env = %env_var, "using bearer credential from environment");
                Self::new(Some(token))
            }
            Err(_) => {
                warn!(env = %env_var, "no bearer credential configured, requests will be anonymous");
                Self::new(None)
            }
        }
    }

    /// Replace the held token, e.g. after a fresh login.
    pub fn set(&self, token: String) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(token);
    }
}

impl CredentialProvider for StaticCredential {
    fn bearer_token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn invalidate(&self) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            warn!("bearer credential invalidated after authentication failure");
        }
    }
}
