//! Stream-JSON envelope parsing.
//!
//! Providers that stream structured output emit one JSON object per line.
//! A small set of envelope families is understood; anything else is kept in
//! the raw transcript but contributes nothing to the parsed text.

use serde_json::Value;

/// Extract the incremental text delta from one stream-JSON line, if any.
///
/// Recognized shapes:
/// - `{"type":"stream_event","event":{"type":"content_block_delta","delta":{"text":…}}}`
/// - `{"text": …}` with no type discriminator
/// - `{"type":"text"|"text_delta"|"content_block_delta", …}` carrying
///   `text`, `delta.text`, or `content`
pub fn extract_text_delta(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;

    match value.get("type").and_then(Value::as_str) {
        Some("stream_event") => {
            let event = value.get("event")?;
            if event.get("type").and_then(Value::as_str) == Some("content_block_delta") {
                event
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                    .map(String::from)
            } else {
                None
            }
        }
        Some("text" | "text_delta" | "content_block_delta") => value
            .get("text")
            .and_then(Value::as_str)
            .or_else(|| {
                value
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
            })
            .or_else(|| value.get("content").and_then(Value::as_str))
            .map(String::from),
        None => value.get("text").and_then(Value::as_str).map(String::from),
        Some(_) => None,
    }
}

/// Accumulates parsed text from a stream-JSON transcript line by line.
#[derive(Debug, Default)]
pub struct StreamTextAccumulator {
    text: String,
}

impl StreamTextAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line; returns the delta that was extracted, if any.
    pub fn feed(&mut self, line: &str) -> Option<String> {
        let delta = extract_text_delta(line)?;
        self.text.push_str(&delta);
        Some(delta)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn into_text(self) -> String {
        self.text
    }
}
