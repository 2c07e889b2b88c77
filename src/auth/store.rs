use std::sync::{PoisonError, RwLock};

use tracing::info;

use crate::models::TokenPair;

/// Shared access/refresh token state.
///
/// The refresh cycle in [`TokenGuard`](super::TokenGuard) is the only writer
/// during streaming. Two sends racing on a refresh both write an equally valid
/// pair, so implementations only need each call to be atomic.
pub trait AuthStore: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn refresh_token(&self) -> Option<String>;
    fn set_tokens(&self, access_token: String, refresh_token: String);
    /// Clears all credentials. Callers should route the user back to login.
    fn logout(&self);
}

/// Process-local token store.
#[derive(Debug, Default)]
pub struct InMemoryAuthStore {
    tokens: RwLock<Option<TokenPair>>,
}

impl InMemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            tokens: RwLock::new(Some(TokenPair {
                access_token: access_token.into(),
                refresh_token: refresh_token.into(),
            })),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn tokens(&self) -> Option<TokenPair> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl AuthStore for InMemoryAuthStore {
    fn access_token(&self) -> Option<String> {
        self.tokens()
            .map(|t| t.access_token)
            .filter(|t| !t.is_empty())
    }

    fn refresh_token(&self) -> Option<String> {
        self.tokens()
            .map(|t| t.refresh_token)
            .filter(|t| !t.is_empty())
    }

    fn set_tokens(&self, access_token: String, refresh_token: String) {
        let mut guard = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(TokenPair { access_token, refresh_token });
    }

    fn logout(&self) {
        info!("Clearing stored credentials");
        let mut guard = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }
}
