use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{stream, FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::ChatError;

use super::{ByteStream, ChatRequest, ChatTransport};

enum Scripted {
    Ready(Result<ByteStream, ChatError>),
    Hang,
}

/// In-process transport that replays queued responses in order.
pub(crate) struct ScriptedTransport {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Queue a body that yields `chunks` and then ends.
    pub(crate) fn push_body(&self, chunks: &[&str]) {
        let chunks: Vec<Vec<u8>> = chunks.iter().map(|c| c.as_bytes().to_vec()).collect();
        self.push_byte_chunks(chunks);
    }

    pub(crate) fn push_byte_chunks(&self, chunks: Vec<Vec<u8>>) {
        let body = stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c)))).boxed();
        self.responses.lock().push_back(Scripted::Ready(Ok(body)));
    }

    /// Queue a body driven by the returned sender. Dropping it ends the body.
    pub(crate) fn push_channel(&self) -> mpsc::UnboundedSender<Result<Bytes, ChatError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let body = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        self.responses.lock().push_back(Scripted::Ready(Ok(body)));
        tx
    }

    pub(crate) fn push_error(&self, err: ChatError) {
        self.responses.lock().push_back(Scripted::Ready(Err(err)));
    }

    /// Queue an open that never resolves.
    pub(crate) fn push_hang(&self) {
        self.responses.lock().push_back(Scripted::Hang);
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

impl ChatTransport for ScriptedTransport {
    fn open(&self, request: ChatRequest) -> BoxFuture<'_, Result<ByteStream, ChatError>> {
        self.requests.lock().push(request);
        let next = self.responses.lock().pop_front();
        match next {
            Some(Scripted::Ready(result)) => futures_util::future::ready(result).boxed(),
            Some(Scripted::Hang) => futures_util::future::pending().boxed(),
            None => futures_util::future::ready(Err(ChatError::Transport(
                "no scripted response".to_string(),
            )))
            .boxed(),
        }
    }
}
