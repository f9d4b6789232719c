use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::protocol::{Role, WireMessage};
use crate::widget::WidgetPayload;

/// One entry in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<WidgetPayload>,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            widget: None,
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            widget: None,
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            widget: None,
        }
    }

    /// The `{role, content}` form sent in request bodies. Widgets stay local.
    #[must_use]
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

struct StoreInner {
    messages: RwLock<Vec<ChatMessage>>,
    revision: watch::Sender<u64>,
}

/// Shared, append-only message list.
///
/// Cloning yields another handle to the same list. Every mutation bumps a
/// revision counter that observers follow through [`ConversationStore::subscribe`].
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_messages(Vec::new())
    }

    #[must_use]
    pub fn with_messages(messages: Vec<ChatMessage>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                messages: RwLock::new(messages),
                revision,
            }),
        }
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|rev| *rev += 1);
    }

    /// Append a user message and return its index.
    pub fn push_user(&self, content: impl Into<String>) -> usize {
        self.push(ChatMessage::user(content))
    }

    /// Append an empty assistant message to be filled by a stream.
    pub fn push_assistant_placeholder(&self) -> usize {
        self.push(ChatMessage::assistant(String::new()))
    }

    pub fn push(&self, message: ChatMessage) -> usize {
        let index = {
            let mut messages = self.inner.messages.write();
            messages.push(message);
            messages.len() - 1
        };
        self.bump();
        index
    }

    /// Replace content and widget of the message at `index`.
    ///
    /// Returns `false` when no message exists there.
    pub fn update_message(
        &self,
        index: usize,
        content: String,
        widget: Option<WidgetPayload>,
    ) -> bool {
        {
            let mut messages = self.inner.messages.write();
            let Some(message) = messages.get_mut(index) else {
                return false;
            };
            if message.content == content && message.widget == widget {
                return true;
            }
            message.content = content;
            message.widget = widget;
        }
        self.bump();
        true
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<ChatMessage> {
        self.inner.messages.read().get(index).cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.inner.messages.read().clone()
    }

    /// Request history in wire form.
    #[must_use]
    pub fn wire_history(&self) -> Vec<WireMessage> {
        self.inner
            .messages
            .read()
            .iter()
            .map(ChatMessage::to_wire)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.messages.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.messages.read().is_empty()
    }

    /// Number of user messages after the latest assistant message.
    ///
    /// Zero when the conversation does not end with a user message, so a
    /// cycle never starts while the last turn is already answered.
    #[must_use]
    pub fn pending_user_count(&self) -> usize {
        let messages = self.inner.messages.read();
        if messages.last().map(|m| m.role) != Some(Role::User) {
            return 0;
        }
        messages
            .iter()
            .rev()
            .take_while(|m| m.role != Role::Assistant)
            .filter(|m| m.role == Role::User)
            .count()
    }

    /// Receiver that changes whenever the message list does.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }
}
