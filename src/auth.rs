use http::header::{HeaderValue, AUTHORIZATION};

use crate::config::BackendConfig;
use crate::error::ChatError;

/// Source of the bearer token attached to every chat request.
///
/// Looked up per request so a refreshed token is picked up by the next turn.
pub trait TokenStore: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// A fixed token, typically from config.
pub struct StaticTokenStore {
    token: String,
}

impl StaticTokenStore {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenStore for StaticTokenStore {
    fn bearer_token(&self) -> Option<String> {
        Some(self.token.clone())
    }
}

/// Reads the token from an environment variable on every lookup.
pub struct EnvTokenStore {
    var: String,
}

impl EnvTokenStore {
    #[must_use]
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenStore for EnvTokenStore {
    fn bearer_token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

/// Build the token store described by the backend config.
///
/// A literal `token` wins over `token_env`.
///
/// # Errors
///
/// Returns `ChatError::Config` when neither source is configured.
pub fn token_store_from_config(backend: &BackendConfig) -> Result<Box<dyn TokenStore>, ChatError> {
    if let Some(token) = backend.token.as_deref().filter(|t| !t.trim().is_empty()) {
        return Ok(Box::new(StaticTokenStore::new(token)));
    }
    if let Some(var) = backend.token_env.as_deref().filter(|v| !v.trim().is_empty()) {
        return Ok(Box::new(EnvTokenStore::new(var)));
    }
    Err(ChatError::Config(
        "backend must set either token or token_env".to_string(),
    ))
}

/// Build the `Authorization: Bearer <token>` header from the store.
///
/// # Errors
///
/// Returns `ChatError::Auth` when no token is available or it is not a valid
/// header value.
pub fn authorization_header(store: &dyn TokenStore) -> Result<(http::HeaderName, HeaderValue), ChatError> {
    let token = store
        .bearer_token()
        .ok_or_else(|| ChatError::Auth("Missing bearer token".to_string()))?;
    let mut value = HeaderValue::try_from(format!("Bearer {}", token.trim()))
        .map_err(|_| ChatError::Auth("Bearer token is not a valid header value".to_string()))?;
    value.set_sensitive(true);
    Ok((AUTHORIZATION, value))
}
