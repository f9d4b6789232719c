use std::sync::LazyLock;

use memchr::memmem;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

// Widget blocks embedded in assistant text.
//
// The model may emit one `<widget type="TYPE">JSON</widget>` block anywhere in
// its reply. Extraction is atomic: the block is stripped from the display text
// only once its body parses as a JSON object, otherwise the text is shown
// unchanged.

const CLOSE_TAG: &str = "</widget>";
static CLOSE_FINDER: LazyLock<memmem::Finder<'static>> =
    LazyLock::new(|| memmem::Finder::new(CLOSE_TAG.as_bytes()));
static OPEN_TAG: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"<widget\s+type\s*=\s*"([^"]*)"\s*>"#).ok());

/// Structured payload extracted from an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetPayload {
    #[serde(rename = "type")]
    pub widget_type: String,
    pub data: serde_json::Value,
}

impl WidgetPayload {
    #[must_use]
    pub fn kind(&self) -> WidgetKind {
        WidgetKind::from_type(&self.widget_type)
    }
}

/// Known widget renderers. Anything else falls back to raw rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetKind {
    TaskList,
    EmailDraft,
    CalendarEvent,
    Other(String),
}

impl WidgetKind {
    #[must_use]
    pub fn from_type(widget_type: &str) -> Self {
        match widget_type {
            "task_list" | "task-list" => WidgetKind::TaskList,
            "email_draft" | "email-draft" => WidgetKind::EmailDraft,
            "calendar_event" | "calendar-event" => WidgetKind::CalendarEvent,
            other => WidgetKind::Other(other.to_string()),
        }
    }
}

/// When widget bodies are parsed during a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetParsePolicy {
    /// Attempt extraction on every update. Malformed model output stays raw.
    #[default]
    EveryDelta,
    /// Show raw text while streaming; extract once the stream terminates.
    OnDone,
}

/// Display projection of an assistant buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetView {
    pub display_text: String,
    pub widget: Option<WidgetPayload>,
}

impl WidgetView {
    fn raw(buffer: &str) -> Self {
        Self {
            display_text: buffer.to_string(),
            widget: None,
        }
    }
}

#[derive(Debug, Clone)]
struct WidgetBlock {
    start: usize,
    end: usize,
    payload: WidgetPayload,
}

impl WidgetBlock {
    fn view(&self, buffer: &str) -> WidgetView {
        let mut display = String::with_capacity(buffer.len() - (self.end - self.start));
        display.push_str(&buffer[..self.start]);
        display.push_str(&buffer[self.end..]);
        WidgetView {
            display_text: display.trim().to_string(),
            widget: Some(self.payload.clone()),
        }
    }
}

/// Separate display text from the first complete widget block in `buffer`.
///
/// Idempotent; the whole buffer is examined on every call.
#[must_use]
pub fn extract(buffer: &str) -> WidgetView {
    match find_block(buffer) {
        Some(block) => block.view(buffer),
        None => WidgetView::raw(buffer),
    }
}

fn find_block(buffer: &str) -> Option<WidgetBlock> {
    let open_tag = OPEN_TAG.as_ref()?;
    let captures = open_tag.captures(buffer)?;
    let open = captures.get(0)?;
    let widget_type = captures.get(1).map_or("", |m| m.as_str());
    let body_start = open.end();

    // First close tag wins; later ones are tried only when the body so far is
    // not a JSON object (a payload string may contain the close tag literally).
    for rel in CLOSE_FINDER.find_iter(&buffer.as_bytes()[body_start..]) {
        let body_end = body_start + rel;
        let body = &buffer[body_start..body_end];
        if let Ok(data @ serde_json::Value::Object(_)) = serde_json::from_str(body) {
            return Some(WidgetBlock {
                start: open.start(),
                end: body_end + CLOSE_TAG.len(),
                payload: WidgetPayload {
                    widget_type: widget_type.to_string(),
                    data,
                },
            });
        }
    }
    None
}

fn contains_complete_looking_block(buffer: &str) -> bool {
    let Some(open_tag) = OPEN_TAG.as_ref() else {
        return false;
    };
    open_tag
        .find(buffer)
        .is_some_and(|open| CLOSE_FINDER.find(&buffer.as_bytes()[open.end()..]).is_some())
}

// ---------------------------------------------------------------------------
// WidgetTracker
// ---------------------------------------------------------------------------

/// Per-message incremental wrapper around [`extract`].
///
/// Assumes the buffer only ever grows by appending. Produces exactly what
/// [`extract`] would on the same buffer, but resolves a widget once and only
/// rescans when a new close tag may have arrived.
#[derive(Debug)]
pub struct WidgetTracker {
    policy: WidgetParsePolicy,
    resolved: Option<WidgetBlock>,
    scanned_len: usize,
}

impl WidgetTracker {
    #[must_use]
    pub fn new(policy: WidgetParsePolicy) -> Self {
        Self {
            policy,
            resolved: None,
            scanned_len: 0,
        }
    }

    #[must_use]
    pub fn policy(&self) -> WidgetParsePolicy {
        self.policy
    }

    /// Project the buffer while the stream is still arriving.
    pub fn update(&mut self, buffer: &str) -> WidgetView {
        match self.policy {
            WidgetParsePolicy::EveryDelta => self.scan(buffer),
            WidgetParsePolicy::OnDone => WidgetView::raw(buffer),
        }
    }

    /// Project the final buffer once the stream has terminated.
    pub fn finish(&mut self, buffer: &str) -> WidgetView {
        let view = self.scan(buffer);
        if view.widget.is_none() && contains_complete_looking_block(buffer) {
            tracing::warn!("widget block did not parse as JSON; showing raw text");
        }
        view
    }

    fn scan(&mut self, buffer: &str) -> WidgetView {
        if let Some(block) = &self.resolved {
            return block.view(buffer);
        }

        let scan_from = self
            .scanned_len
            .saturating_sub(CLOSE_TAG.len() - 1)
            .min(buffer.len());
        let new_close_tag = CLOSE_FINDER.find(&buffer.as_bytes()[scan_from..]).is_some();
        self.scanned_len = buffer.len();
        if !new_close_tag {
            return WidgetView::raw(buffer);
        }

        match find_block(buffer) {
            Some(block) => {
                let view = block.view(buffer);
                self.resolved = Some(block);
                view
            }
            None => WidgetView::raw(buffer),
        }
    }
}
