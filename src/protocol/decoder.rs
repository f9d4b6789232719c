use crate::stream::{is_done_event, SseEvent};

use super::ChatStreamChunk;

/// What a single SSE record means for the session reading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Incremental assistant text; may be empty when the chunk carries no content.
    Delta(String),
    /// The `[DONE]` sentinel: no further records should be processed.
    Done,
    /// The backend reported an error inside the stream.
    Error(String),
    /// The payload was not a decodable chunk and is ignored.
    Skip,
}

/// Decode one SSE record into a [`DeltaOutcome`].
///
/// Pure: accumulation of deltas is the caller's job.
#[must_use]
pub fn decode(record: &SseEvent) -> DeltaOutcome {
    if is_done_event(record) {
        return DeltaOutcome::Done;
    }

    let chunk: ChatStreamChunk = match serde_json::from_str(&record.data) {
        Ok(chunk) => chunk,
        Err(err) => {
            // A payload of unexpected shape may still carry an error report.
            if let Some(error) = stray_error(&record.data) {
                return DeltaOutcome::Error(error);
            }
            tracing::debug!("skipping undecodable stream chunk: {err}");
            return DeltaOutcome::Skip;
        }
    };

    if let Some(error) = chunk.error.as_ref().filter(|value| !value.is_null()) {
        return DeltaOutcome::Error(error_message(error));
    }

    let delta = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .unwrap_or_default();
    DeltaOutcome::Delta(delta)
}

fn stray_error(data: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    value
        .get("error")
        .filter(|error| !error.is_null())
        .map(error_message)
}

fn error_message(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(message) => message.clone(),
        serde_json::Value::Object(fields) => match fields.get("message") {
            Some(serde_json::Value::String(message)) => message.clone(),
            _ => error.to_string(),
        },
        other => other.to_string(),
    }
}
