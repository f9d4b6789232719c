pub mod decoder;

use serde::{Deserialize, Deserializer, Serialize};

pub use decoder::{decode, DeltaOutcome};

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Chat completion request body sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<WireMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_ref_ids: Vec<String>,
}

/// A `{role, content}` history entry in the request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

/// One streamed chunk: the JSON payload of a non-terminal SSE record.
///
/// `null` in any container field reads as empty so an `error` sibling is
/// never lost to a shape mismatch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatStreamChunk {
    #[serde(default, deserialize_with = "null_as_default")]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// A single choice in a streamed chunk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamChoice {
    #[serde(default, deserialize_with = "null_as_default")]
    pub delta: StreamDelta,
}

/// Incremental content carried by a choice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
