mod request_id;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::conversation::ConversationStore;
use crate::error::ChatError;
use crate::protocol::{decode, ChatCompletionRequest, DeltaOutcome, WireMessage};
use crate::stream::SseParser;
use crate::transport::{ByteStream, ChatRequest, ChatTransport};
use crate::widget::{WidgetPayload, WidgetTracker};

use self::request_id::RequestIdGenerator;

/// Lifecycle of one streamed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed(ChatError),
    Cancelled,
}

impl SessionOutcome {
    fn state(&self) -> SessionState {
        match self {
            SessionOutcome::Completed => SessionState::Completed,
            SessionOutcome::Failed(_) => SessionState::Failed,
            SessionOutcome::Cancelled => SessionState::Cancelled,
        }
    }
}

struct ActiveSlot {
    id: u64,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

type SharedSlot = Arc<Mutex<Option<ActiveSlot>>>;

/// Runs at most one streaming reply per conversation.
///
/// Starting a session cancels the previous one. Every write into the
/// conversation happens under the active-slot lock and only while the writer
/// is still the current, uncancelled session, so once `start` or `cancel`
/// returns the old session can no longer touch the message list.
pub struct SessionController {
    transport: Arc<dyn ChatTransport>,
    store: ConversationStore,
    config: SessionConfig,
    active: SharedSlot,
    next_id: AtomicU64,
    request_ids: RequestIdGenerator,
}

impl SessionController {
    #[must_use]
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: ConversationStore,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport,
            store,
            config,
            active: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            request_ids: RequestIdGenerator::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Start streaming a reply to `history`.
    ///
    /// Appends the assistant placeholder before returning. Must be called
    /// from within a tokio runtime.
    pub fn start(&self, history: Vec<WireMessage>, context_refs: Vec<String>) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request_id = self.request_ids.next();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Opening);

        let message_index = {
            let mut active = self.active.lock();
            if let Some(previous) = active.take() {
                previous.cancel.cancel();
                tracing::debug!(session_id = previous.id, "superseded by a newer session");
            }
            let index = self.store.push_assistant_placeholder();
            *active = Some(ActiveSlot {
                id,
                cancel: cancel.clone(),
                state: state_rx.clone(),
            });
            index
        };

        tracing::info!(
            session_id = id,
            request_id = %request_id,
            message_index,
            history_len = history.len(),
            "chat session started"
        );

        let request = ChatRequest {
            request_id,
            body: ChatCompletionRequest {
                messages: history,
                context_ref_ids: context_refs,
            },
        };
        let session = StreamSession {
            id,
            message_index,
            cancel: cancel.clone(),
            buffered_text: String::new(),
            tracker: WidgetTracker::new(self.config.widget_parse),
            active: Arc::clone(&self.active),
            store: self.store.clone(),
            state: state_tx,
        };
        let join = tokio::spawn(session.run(
            Arc::clone(&self.transport),
            request,
            self.config.idle_timeout(),
        ));

        SessionHandle {
            id,
            request_id,
            message_index,
            state: state_rx,
            cancel,
            active: Arc::clone(&self.active),
            join,
        }
    }

    /// Cancel whichever session is current. Returns `false` when none was.
    pub fn cancel_active(&self) -> bool {
        let mut active = self.active.lock();
        match active.take() {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// State of the current session, or `Idle` when none is running.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.active
            .lock()
            .as_ref()
            .map_or(SessionState::Idle, |slot| *slot.state.borrow())
    }
}

/// Caller-side view of a started session.
pub struct SessionHandle {
    id: u64,
    request_id: uuid::Uuid,
    message_index: usize,
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    active: SharedSlot,
    join: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sent to the backend as `x-request-id`.
    #[must_use]
    pub fn request_id(&self) -> uuid::Uuid {
        self.request_id
    }

    /// Index of the assistant message this session writes to.
    #[must_use]
    pub fn message_index(&self) -> usize {
        self.message_index
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Stop the session. Partial content stays in place.
    ///
    /// No write from this session happens after this returns.
    pub fn cancel(&self) {
        let mut active = self.active.lock();
        self.cancel.cancel();
        if active.as_ref().is_some_and(|slot| slot.id == self.id) {
            *active = None;
        }
    }

    /// Wait for the session task to finish.
    pub async fn wait(self) -> SessionOutcome {
        self.join.await.unwrap_or_else(|err| {
            SessionOutcome::Failed(ChatError::Internal(format!("session task failed: {err}")))
        })
    }
}

struct StreamSession {
    id: u64,
    message_index: usize,
    cancel: CancellationToken,
    buffered_text: String,
    tracker: WidgetTracker,
    active: SharedSlot,
    store: ConversationStore,
    state: watch::Sender<SessionState>,
}

impl StreamSession {
    async fn run(
        mut self,
        transport: Arc<dyn ChatTransport>,
        request: ChatRequest,
        idle_timeout: Option<Duration>,
    ) -> SessionOutcome {
        let outcome = self.drive(transport.as_ref(), request, idle_timeout).await;
        self.release();
        self.state.send_replace(outcome.state());
        outcome
    }

    async fn drive(
        &mut self,
        transport: &dyn ChatTransport,
        request: ChatRequest,
        idle_timeout: Option<Duration>,
    ) -> SessionOutcome {
        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return self.cancelled(),
            opened = with_idle_timeout(idle_timeout, transport.open(request)) => opened,
        };
        let mut body = match opened {
            Ok(body) => body,
            Err(err) => return self.fail(err),
        };

        let mut parser = SseParser::new();
        let mut records = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.cancelled(),
                next = next_chunk(&mut body, idle_timeout) => next,
            };
            let chunk = match next {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => return self.fail(err),
            };
            if *self.state.borrow() == SessionState::Opening {
                self.state.send_replace(SessionState::Streaming);
            }

            records.clear();
            parser.feed_bytes(&chunk, &mut records);
            for record in &records {
                match decode(record) {
                    DeltaOutcome::Skip => {}
                    DeltaOutcome::Delta(text) => {
                        if text.is_empty() {
                            continue;
                        }
                        self.buffered_text.push_str(&text);
                        let view = self.tracker.update(&self.buffered_text);
                        if !self.write(view.display_text, view.widget) {
                            return self.cancelled();
                        }
                    }
                    DeltaOutcome::Done => return self.complete(),
                    DeltaOutcome::Error(message) => {
                        return self.fail(ChatError::Protocol(message));
                    }
                }
            }
        }

        let dropped = parser.finish();
        if dropped > 0 {
            tracing::debug!(
                session_id = self.id,
                dropped_bytes = dropped,
                "stream ended with an unterminated record"
            );
        }
        self.complete()
    }

    fn is_current(&self, active: &Option<ActiveSlot>) -> bool {
        active
            .as_ref()
            .is_some_and(|slot| slot.id == self.id && !slot.cancel.is_cancelled())
    }

    fn write(&self, content: String, widget: Option<WidgetPayload>) -> bool {
        let active = self.active.lock();
        if !self.is_current(&active) {
            return false;
        }
        self.store.update_message(self.message_index, content, widget);
        true
    }

    // Final write and slot release happen under one lock.
    fn commit(&self, content: String, widget: Option<WidgetPayload>) -> bool {
        let mut active = self.active.lock();
        if !self.is_current(&active) {
            return false;
        }
        self.store.update_message(self.message_index, content, widget);
        *active = None;
        true
    }

    fn release(&self) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|slot| slot.id == self.id) {
            *active = None;
        }
    }

    fn complete(&mut self) -> SessionOutcome {
        let view = self.tracker.finish(&self.buffered_text);
        if !self.commit(view.display_text, view.widget) {
            return self.cancelled();
        }
        tracing::info!(
            session_id = self.id,
            chars = self.buffered_text.len(),
            "chat session completed"
        );
        SessionOutcome::Completed
    }

    fn fail(&self, err: ChatError) -> SessionOutcome {
        if !self.commit(err.user_message(), None) {
            return self.cancelled();
        }
        tracing::warn!(session_id = self.id, error = %err, "chat session failed");
        SessionOutcome::Failed(err)
    }

    fn cancelled(&self) -> SessionOutcome {
        tracing::debug!(session_id = self.id, "chat session cancelled");
        SessionOutcome::Cancelled
    }
}

async fn with_idle_timeout<T>(
    limit: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T, ChatError>>,
) -> Result<T, ChatError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ChatError::IdleTimeout {
                secs: limit.as_secs(),
            })?,
        None => fut.await,
    }
}

async fn next_chunk(
    body: &mut ByteStream,
    idle_timeout: Option<Duration>,
) -> Result<Option<Bytes>, ChatError> {
    with_idle_timeout(idle_timeout, async { body.next().await.transpose() }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ChatMessage;
    use crate::protocol::Role;
    use crate::stream::data_frame;
    use crate::transport::scripted::ScriptedTransport;
    use crate::widget::WidgetParsePolicy;

    fn delta(text: &str) -> String {
        let chunk = serde_json::json!({"choices": [{"delta": {"content": text}}]});
        data_frame(&chunk.to_string())
    }

    const DONE: &str = "data: [DONE]\n\n";

    fn controller(
        transport: &Arc<ScriptedTransport>,
        config: SessionConfig,
    ) -> (SessionController, ConversationStore) {
        let store = ConversationStore::new();
        let transport: Arc<dyn ChatTransport> = transport.clone();
        (
            SessionController::new(transport, store.clone(), config),
            store,
        )
    }

    async fn wait_for_content(store: &ConversationStore, index: usize, expected: &str) {
        let mut rx = store.subscribe();
        let wait = async {
            loop {
                if store.get(index).is_some_and(|m| m.content == expected) {
                    return;
                }
                rx.changed().await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("content never became {expected:?}"));
    }

    fn start_with_history(controller: &SessionController) -> SessionHandle {
        let history = controller.store().wire_history();
        controller.start(history, Vec::new())
    }

    #[tokio::test]
    async fn test_single_delta_then_done() {
        let transport = ScriptedTransport::new();
        transport.push_body(&[&delta("Hi"), DONE]);
        let (controller, store) = controller(&transport, SessionConfig::default());
        store.push_user("hello");

        let handle = start_with_history(&controller);
        assert_eq!(handle.message_index(), 1);
        assert_eq!(store.len(), 2);
        let state = handle.subscribe_state();

        assert_eq!(handle.wait().await, SessionOutcome::Completed);
        assert_eq!(*state.borrow(), SessionState::Completed);

        let messages = store.snapshot();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], ChatMessage::assistant("Hi"));
        assert!(!controller.is_active());
        assert_eq!(controller.state(), SessionState::Idle);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body.messages.len(), 1);
        assert_eq!(requests[0].body.messages[0].role, Role::User);
        assert_eq!(requests[0].body.messages[0].content, "hello");
    }

    #[tokio::test]
    async fn test_arbitrary_chunking_yields_concatenated_deltas() {
        let mut wire = String::new();
        for piece in ["Hel", "lo w", "örld", "", " ✓"] {
            wire.push_str(&delta(piece));
        }
        wire.push_str(DONE);
        let bytes = wire.as_bytes();

        for chunk_size in [1, 2, 3, 7, 64, bytes.len()] {
            let transport = ScriptedTransport::new();
            transport.push_byte_chunks(bytes.chunks(chunk_size).map(<[u8]>::to_vec).collect());
            let (controller, store) = controller(&transport, SessionConfig::default());
            store.push_user("q");
            let handle = start_with_history(&controller);
            let index = handle.message_index();
            assert_eq!(handle.wait().await, SessionOutcome::Completed);
            assert_eq!(store.get(index).unwrap().content, "Hello wörld ✓", "chunk size {chunk_size}");
        }
    }

    #[tokio::test]
    async fn test_records_after_done_are_ignored() {
        let transport = ScriptedTransport::new();
        let tail = format!(
            "{DONE}{}data: {{\"error\":\"late failure\"}}\n\n",
            delta(" extra")
        );
        transport.push_body(&[&delta("Hi"), &tail]);
        let (controller, store) = controller(&transport, SessionConfig::default());
        store.push_user("q");
        let handle = start_with_history(&controller);
        let index = handle.message_index();
        assert_eq!(handle.wait().await, SessionOutcome::Completed);
        assert_eq!(store.get(index).unwrap(), ChatMessage::assistant("Hi"));
    }

    #[tokio::test]
    async fn test_end_of_body_without_done_completes() {
        let transport = ScriptedTransport::new();
        transport.push_body(&[&delta("partial answer")]);
        let (controller, store) = controller(&transport, SessionConfig::default());
        store.push_user("q");
        let handle = start_with_history(&controller);
        let index = handle.message_index();
        assert_eq!(handle.wait().await, SessionOutcome::Completed);
        assert_eq!(store.get(index).unwrap().content, "partial answer");
    }

    #[tokio::test]
    async fn test_error_record_overwrites_placeholder() {
        let transport = ScriptedTransport::new();
        transport.push_body(&[
            &delta("Working on it"),
            "data: {\"error\":{\"message\":\"quota exceeded\"}}\n\n",
            &delta("never shown"),
        ]);
        let (controller, store) = controller(&transport, SessionConfig::default());
        store.push_user("q");
        let handle = start_with_history(&controller);
        let index = handle.message_index();

        let outcome = handle.wait().await;
        assert_eq!(
            outcome,
            SessionOutcome::Failed(ChatError::Protocol("quota exceeded".to_string()))
        );
        let message = store.get(index).unwrap();
        assert_eq!(
            message.content,
            "Sorry, the assistant ran into a problem: quota exceeded"
        );
        assert_eq!(message.widget, None);
    }

    #[tokio::test]
    async fn test_open_failure_shows_single_error_string() {
        let transport = ScriptedTransport::new();
        let err = ChatError::Upstream {
            status: 401,
            message: "expired".to_string(),
        };
        transport.push_error(err.clone());
        let (controller, store) = controller(&transport, SessionConfig::default());
        store.push_user("q");
        let handle = start_with_history(&controller);
        let index = handle.message_index();

        assert_eq!(handle.wait().await, SessionOutcome::Failed(err.clone()));
        assert_eq!(store.get(index).unwrap().content, err.user_message());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_transport_error_mid_body_fails() {
        let transport = ScriptedTransport::new();
        let body = transport.push_channel();
        let (controller, store) = controller(&transport, SessionConfig::default());
        store.push_user("q");
        let handle = start_with_history(&controller);
        let index = handle.message_index();

        body.send(Ok(Bytes::from(delta("half")))).unwrap();
        wait_for_content(&store, index, "half").await;
        body.send(Err(ChatError::Transport("reset".to_string())))
            .unwrap();

        let outcome = handle.wait().await;
        assert!(matches!(outcome, SessionOutcome::Failed(ChatError::Transport(_))));
        assert_eq!(
            store.get(index).unwrap().content,
            ChatError::Transport(String::new()).user_message()
        );
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_content() {
        let transport = ScriptedTransport::new();
        let body = transport.push_channel();
        let (controller, store) = controller(&transport, SessionConfig::default());
        store.push_user("q");
        let handle = start_with_history(&controller);
        let index = handle.message_index();

        body.send(Ok(Bytes::from(delta("partial")))).unwrap();
        wait_for_content(&store, index, "partial").await;
        assert_eq!(handle.state(), SessionState::Streaming);
        assert_eq!(controller.state(), SessionState::Streaming);

        handle.cancel();
        assert!(!controller.is_active());
        let revision = store.revision();
        let _ = body.send(Ok(Bytes::from(delta(" more"))));
        let _ = body.send(Ok(Bytes::from(DONE)));

        assert_eq!(handle.wait().await, SessionOutcome::Cancelled);
        assert_eq!(store.get(index).unwrap().content, "partial");
        assert_eq!(store.revision(), revision);
    }

    #[tokio::test]
    async fn test_cancel_while_opening() {
        let transport = ScriptedTransport::new();
        transport.push_hang();
        let (controller, store) = controller(&transport, SessionConfig::default());
        store.push_user("q");
        let handle = start_with_history(&controller);
        assert_eq!(handle.state(), SessionState::Opening);
        assert!(controller.cancel_active());
        assert_eq!(handle.wait().await, SessionOutcome::Cancelled);
        assert_eq!(store.get(1).unwrap().content, "");
    }

    #[tokio::test]
    async fn test_newer_session_supersedes_older() {
        let transport = ScriptedTransport::new();
        let first_body = transport.push_channel();
        transport.push_body(&[&delta("second"), DONE]);
        let (controller, store) = controller(&transport, SessionConfig::default());
        store.push_user("one");

        let first = start_with_history(&controller);
        first_body.send(Ok(Bytes::from(delta("early")))).unwrap();
        wait_for_content(&store, first.message_index(), "early").await;

        store.push_user("two");
        let second = start_with_history(&controller);
        assert_ne!(first.message_index(), second.message_index());

        // Anything the old stream still delivers is dropped.
        let _ = first_body.send(Ok(Bytes::from(delta(" late"))));
        let _ = first_body.send(Ok(Bytes::from(DONE)));

        let first_index = first.message_index();
        let second_index = second.message_index();
        assert_eq!(first.wait().await, SessionOutcome::Cancelled);
        assert_eq!(second.wait().await, SessionOutcome::Completed);
        assert_eq!(store.get(first_index).unwrap().content, "early");
        assert_eq!(store.get(second_index).unwrap().content, "second");
        assert_eq!(store.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_fails_session() {
        let transport = ScriptedTransport::new();
        let _body = transport.push_channel();
        let config = SessionConfig {
            idle_timeout_secs: Some(5),
            ..SessionConfig::default()
        };
        let (controller, store) = controller(&transport, config);
        store.push_user("q");
        let handle = start_with_history(&controller);
        let index = handle.message_index();

        let outcome = handle.wait().await;
        assert_eq!(
            outcome,
            SessionOutcome::Failed(ChatError::IdleTimeout { secs: 5 })
        );
        assert_eq!(
            store.get(index).unwrap().content,
            ChatError::IdleTimeout { secs: 5 }.user_message()
        );
    }

    #[tokio::test]
    async fn test_widget_extracted_while_streaming() {
        let transport = ScriptedTransport::new();
        transport.push_body(&[
            &delta("Here you go <widget type=\"task_list\">{\"tasks\":"),
            &delta("[\"a\"]}</widget>"),
            DONE,
        ]);
        let (controller, store) = controller(&transport, SessionConfig::default());
        store.push_user("q");
        let handle = start_with_history(&controller);
        let index = handle.message_index();
        assert_eq!(handle.wait().await, SessionOutcome::Completed);

        let message = store.get(index).unwrap();
        assert_eq!(message.content, "Here you go");
        let widget = message.widget.unwrap();
        assert_eq!(widget.widget_type, "task_list");
        assert_eq!(widget.data, serde_json::json!({"tasks": ["a"]}));
    }

    #[tokio::test]
    async fn test_on_done_policy_defers_extraction() {
        let transport = ScriptedTransport::new();
        let body = transport.push_channel();
        let config = SessionConfig {
            widget_parse: WidgetParsePolicy::OnDone,
            ..SessionConfig::default()
        };
        let (controller, store) = controller(&transport, config);
        store.push_user("q");
        let handle = start_with_history(&controller);
        let index = handle.message_index();

        let raw = "Draft: <widget type=\"email_draft\">{\"subject\":\"Hi\"}</widget>";
        body.send(Ok(Bytes::from(delta(raw)))).unwrap();
        wait_for_content(&store, index, raw).await;
        assert_eq!(store.get(index).unwrap().widget, None);

        body.send(Ok(Bytes::from(DONE))).unwrap();
        assert_eq!(handle.wait().await, SessionOutcome::Completed);
        let message = store.get(index).unwrap();
        assert_eq!(message.content, "Draft:");
        assert_eq!(message.widget.unwrap().widget_type, "email_draft");
    }

    #[tokio::test]
    async fn test_malformed_widget_stays_raw() {
        let raw = "See <widget type=\"task_list\">{not json}</widget>";
        let transport = ScriptedTransport::new();
        transport.push_body(&[&delta(raw), DONE]);
        let (controller, store) = controller(&transport, SessionConfig::default());
        store.push_user("q");
        let handle = start_with_history(&controller);
        let index = handle.message_index();
        assert_eq!(handle.wait().await, SessionOutcome::Completed);
        let message = store.get(index).unwrap();
        assert_eq!(message.content, raw);
        assert_eq!(message.widget, None);
    }

    #[tokio::test]
    async fn test_context_refs_sent_with_request() {
        let transport = ScriptedTransport::new();
        transport.push_body(&[DONE]);
        let (controller, store) = controller(&transport, SessionConfig::default());
        store.push_user("summarize");
        let handle = controller.start(
            store.wire_history(),
            vec!["email-1".to_string(), "email-2".to_string()],
        );
        let request_id = handle.request_id();
        assert_eq!(handle.wait().await, SessionOutcome::Completed);

        let requests = transport.requests();
        assert_eq!(requests[0].request_id, request_id);
        assert_eq!(requests[0].body.context_ref_ids, vec!["email-1", "email-2"]);
    }
}
