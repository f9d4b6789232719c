mod http_transport;
#[cfg(test)]
pub(crate) mod scripted;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use crate::error::ChatError;
use crate::protocol::ChatCompletionRequest;

pub use http_transport::{sanitize_backend_error, HttpChatTransport};

/// Raw response body chunks of an open chat stream.
pub type ByteStream = BoxStream<'static, Result<Bytes, ChatError>>;

/// A chat turn ready to be sent.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub request_id: uuid::Uuid,
    pub body: ChatCompletionRequest,
}

/// Opens the streaming connection for one chat turn.
///
/// Resolves once the backend has accepted the request (2xx). Non-success
/// statuses and connect failures resolve to an error instead of a stream.
pub trait ChatTransport: Send + Sync {
    fn open(&self, request: ChatRequest) -> BoxFuture<'_, Result<ByteStream, ChatError>>;
}
