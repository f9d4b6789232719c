//! SSE (Server-Sent Events) record parser and wire helpers.
//!
//! The chat backend only ever sends single-line JSON payloads, so this parser
//! follows the backend's dialect rather than the full browser algorithm:
//! values are trimmed, and a repeated `data:` line replaces the previous one
//! instead of being joined.
use super::SseEvent;
use memchr::memchr_iter;

const DONE_SENTINEL: &str = "[DONE]";
const COMPACT_THRESHOLD: usize = 8 * 1024;

/// Turns arbitrarily split body chunks into complete [`SseEvent`] records.
///
/// Anything after the last newline stays buffered until the next call.
pub struct SseParser {
    buffer: String,
    consumed: usize,
    utf8_remainder: Vec<u8>,
    pending: PendingRecord,
}

#[derive(Default)]
struct PendingRecord {
    event: Option<String>,
    data: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
    has_fields: bool,
}

impl PendingRecord {
    fn take_event(&mut self) -> Option<SseEvent> {
        let record = std::mem::take(self);
        let data = record.data?;
        Some(SseEvent {
            event: record.event,
            data,
            id: record.id,
            retry: record.retry,
        })
    }
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw text and return any complete records parsed.
    ///
    /// Line rules:
    /// - `field: value` splits at the first colon; the value is trimmed
    /// - `data`, `event`, `id`, `retry` overwrite any earlier value in the record
    /// - lines without a colon, comments (`:` prefix) and unknown fields are skipped
    /// - an empty line terminates the record; records without `data` are dropped
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete records into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let mut cursor = self.consumed;
        let unread = &self.buffer.as_bytes()[cursor..];
        let base = cursor;
        for newline in memchr_iter(b'\n', unread).map(|pos| base + pos) {
            let raw = &self.buffer[cursor..newline];
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            Self::process_line(line, &mut self.pending, out);
            cursor = newline + 1;
        }
        self.consumed = cursor;
        self.compact();
    }

    /// Release consumed lines once they dominate the buffer.
    fn compact(&mut self) {
        if self.consumed == self.buffer.len() {
            self.buffer.clear();
            self.consumed = 0;
        } else if self.consumed > COMPACT_THRESHOLD || self.consumed * 2 >= self.buffer.len() {
            self.buffer.replace_range(..self.consumed, "");
            self.consumed = 0;
        }
    }

    /// Feed raw body bytes, carrying an incomplete trailing UTF-8 sequence
    /// over to the next call.
    ///
    /// Invalid sequences in the middle of a chunk are replaced rather than
    /// stalling the stream.
    pub fn feed_bytes(&mut self, chunk: &[u8], out: &mut Vec<SseEvent>) {
        if self.utf8_remainder.is_empty() {
            self.feed_utf8_prefix(chunk, out);
            return;
        }
        let mut joined = std::mem::take(&mut self.utf8_remainder);
        joined.extend_from_slice(chunk);
        self.feed_utf8_prefix(&joined, out);
    }

    fn feed_utf8_prefix(&mut self, bytes: &[u8], out: &mut Vec<SseEvent>) {
        if let Ok(text) = std::str::from_utf8(bytes) {
            self.feed_into(text, out);
            return;
        }
        let mut decoded = String::with_capacity(bytes.len() + 2);
        let mut rest = bytes;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    decoded.push_str(text);
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        decoded.push_str(text);
                    }
                    match err.error_len() {
                        // Truncated sequence at the end of the chunk.
                        None => {
                            self.utf8_remainder.extend_from_slice(tail);
                            break;
                        }
                        Some(bad_len) => {
                            decoded.push('\u{FFFD}');
                            rest = &tail[bad_len..];
                        }
                    }
                }
            }
        }
        self.feed_into(&decoded, out);
    }

    /// Whether a partial record or line is still buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.consumed < self.buffer.len()
            || !self.utf8_remainder.is_empty()
            || self.pending.has_fields
    }

    /// Drop any incomplete trailing record at end of stream.
    ///
    /// Returns the number of buffered bytes discarded. No record is ever
    /// emitted from an unterminated segment.
    pub fn finish(&mut self) -> usize {
        let dropped = self.buffer.len() - self.consumed + self.utf8_remainder.len();
        self.buffer.clear();
        self.consumed = 0;
        self.utf8_remainder.clear();
        self.pending = PendingRecord::default();
        dropped
    }

    fn process_line(line: &str, pending: &mut PendingRecord, events: &mut Vec<SseEvent>) {
        if line.trim().is_empty() {
            if let Some(event) = pending.take_event() {
                events.push(event);
            }
            return;
        }

        let Some((field, value)) = line.split_once(':') else {
            return;
        };
        let value = value.trim();
        match field.trim() {
            "data" => pending.data = Some(value.to_string()),
            "event" => pending.event = Some(value.to_string()),
            "id" => pending.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    pending.retry = Some(ms);
                }
            }
            // Comments have an empty field name; unknown names are ignored.
            _ => return,
        }
        pending.has_fields = true;
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self {
            buffer: String::new(),
            consumed: 0,
            utf8_remainder: Vec::new(),
            pending: PendingRecord::default(),
        }
    }
}

/// True for the `[DONE]` sentinel that ends a reply.
#[must_use]
pub fn is_done_event(event: &SseEvent) -> bool {
    event.data.trim() == DONE_SENTINEL
}

#[must_use]
pub fn done_frame() -> String {
    data_frame(DONE_SENTINEL)
}

/// Format an unnamed, single-line `data` record.
#[must_use]
pub fn data_frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}
