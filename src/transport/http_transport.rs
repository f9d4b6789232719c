use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};

use crate::auth::{authorization_header, token_store_from_config, TokenStore};
use crate::config::BackendConfig;
use crate::error::ChatError;

use super::{ByteStream, ChatRequest, ChatTransport};

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
const ERROR_BODY_MAX_LEN: usize = 500;

fn build_reqwest_client(backend: &BackendConfig) -> Result<reqwest::Client, ChatError> {
    // No total timeout: a reply may stream for minutes. Silence is bounded by
    // the session idle timeout instead.
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(backend.pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(backend.pool_idle_timeout_secs))
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(backend.connect_timeout_secs))
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = backend.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| ChatError::Config(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !backend.use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| ChatError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// Chat transport over HTTP POST + SSE response body.
pub struct HttpChatTransport {
    client: reqwest::Client,
    url: url::Url,
    tokens: Box<dyn TokenStore>,
}

impl HttpChatTransport {
    /// Build a transport whose token source is taken from the backend config.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Config`] when the URL, proxy, or token source is
    /// invalid, or [`ChatError::Transport`] when the client cannot be built.
    pub fn from_config(backend: &BackendConfig) -> Result<Self, ChatError> {
        let tokens = token_store_from_config(backend)?;
        Self::new(backend, tokens)
    }

    /// Build a transport with an explicit token store.
    ///
    /// # Errors
    ///
    /// Same as [`HttpChatTransport::from_config`], minus token-source checks.
    pub fn new(backend: &BackendConfig, tokens: Box<dyn TokenStore>) -> Result<Self, ChatError> {
        let url = url::Url::parse(&backend.chat_url())
            .map_err(|err| ChatError::Config(format!("Invalid chat URL: {err}")))?;
        Ok(Self {
            client: build_reqwest_client(backend)?,
            url,
            tokens,
        })
    }

    #[must_use]
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    fn headers(&self, request_id: uuid::Uuid) -> Result<HeaderMap, ChatError> {
        let mut headers = HeaderMap::with_capacity(4);
        let (name, value) = authorization_header(self.tokens.as_ref())?;
        headers.insert(name, value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        let request_id = HeaderValue::try_from(request_id.to_string())
            .map_err(|err| ChatError::Internal(format!("Invalid request id: {err}")))?;
        headers.insert(REQUEST_ID_HEADER, request_id);
        Ok(headers)
    }

    async fn send(&self, request: ChatRequest) -> Result<ByteStream, ChatError> {
        let headers = self.headers(request.request_id)?;
        let body = serde_json::to_vec(&request.body)
            .map_err(|err| ChatError::Internal(format!("Failed to encode request: {err}")))?;

        let response = self
            .client
            .post(self.url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| ChatError::Transport(format!("Request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_bytes = response
                .bytes()
                .await
                .map_err(|e| ChatError::Transport(format!("Failed to read error body: {e}")))?;
            tracing::warn!(
                request_id = %request.request_id,
                status = status.as_u16(),
                "chat backend rejected request"
            );
            return Err(ChatError::Upstream {
                status: status.as_u16(),
                message: sanitize_backend_error(&body_bytes),
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|err| ChatError::Transport(format!("Stream read failed: {err}")))
            })
            .boxed())
    }
}

impl ChatTransport for HttpChatTransport {
    fn open(&self, request: ChatRequest) -> BoxFuture<'_, Result<ByteStream, ChatError>> {
        self.send(request).boxed()
    }
}

/// Reduce a non-2xx response body to a short message.
///
/// Prefers `error.message` (or a string `error` / `detail`) from JSON bodies,
/// otherwise lossy UTF-8. Capped at 500 bytes on a char boundary.
#[must_use]
pub fn sanitize_backend_error(body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        let message = json
            .get("error")
            .and_then(|e| e.get("message").and_then(|m| m.as_str()).or_else(|| e.as_str()))
            .or_else(|| json.get("detail").and_then(|d| d.as_str()));
        if let Some(msg) = message {
            return truncate(msg);
        }
    }
    truncate(&String::from_utf8_lossy(body))
}

fn truncate(text: &str) -> String {
    if text.len() <= ERROR_BODY_MAX_LEN {
        return text.to_string();
    }
    let mut end = ERROR_BODY_MAX_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenStore;

    #[test]
    fn test_sanitize_prefers_error_message() {
        let body = br#"{"error":{"message":"bad token","type":"auth"}}"#;
        assert_eq!(sanitize_backend_error(body), "bad token");
        assert_eq!(sanitize_backend_error(br#"{"detail":"Not found"}"#), "Not found");
        assert_eq!(sanitize_backend_error(br#"{"error":"quota"}"#), "quota");
        assert_eq!(sanitize_backend_error(b"gateway down"), "gateway down");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let body = "é".repeat(400);
        let message = sanitize_backend_error(body.as_bytes());
        assert!(message.ends_with("..."));
        assert!(message.len() <= ERROR_BODY_MAX_LEN + 3);
    }

    #[test]
    fn test_headers() {
        let mut backend = BackendConfig::new("http://127.0.0.1:1/api/");
        backend.token = Some("tok".to_string());
        let transport =
            HttpChatTransport::new(&backend, Box::new(StaticTokenStore::new("tok"))).unwrap();
        assert_eq!(transport.url().as_str(), "http://127.0.0.1:1/api/chat/completions");

        let id = uuid::Uuid::from_u128(7);
        let headers = transport.headers(id).unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.get(ACCEPT).unwrap(), "text/event-stream");
        assert_eq!(
            headers.get("x-request-id").unwrap().to_str().unwrap(),
            id.to_string()
        );
    }
}
