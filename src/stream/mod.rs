pub mod sse;

pub use sse::{data_frame, done_frame, is_done_event, SseParser};

/// A parsed SSE record from the chat backend.
///
/// Every field holds the last value seen before the blank-line terminator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}
