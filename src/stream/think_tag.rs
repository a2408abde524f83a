//! Folds `reasoning_content` deltas into inline `<think>...</think>` content
//! for clients that only understand the tagged convention.

use serde_json::Value;

use super::ChunkTransform;
use crate::sse::{SseMessage, SseParser};

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThinkState {
    Pending,
    Thinking,
    Passthrough,
}

#[derive(Debug)]
pub struct ReasoningToThinkTag {
    state: ThinkState,
    parser: SseParser,
    /// Last rewritten reasoning event; it receives the closing tag.
    held: Option<(SseMessage, Value)>,
}

impl Default for ReasoningToThinkTag {
    fn default() -> Self {
        Self::new()
    }
}

impl ReasoningToThinkTag {
    pub fn new() -> Self {
        Self {
            state: ThinkState::Pending,
            parser: SseParser::default(),
            held: None,
        }
    }

    fn on_event(&mut self, event: SseMessage, out: &mut Vec<String>) {
        if self.state == ThinkState::Passthrough {
            out.push(event.encode());
            return;
        }

        let Some(mut json) = event.json() else {
            self.finalize(out);
            out.push(event.encode());
            return;
        };

        match take_reasoning(&mut json) {
            Some(reasoning) => {
                let text = if self.state == ThinkState::Pending {
                    format!("{THINK_OPEN}{reasoning}")
                } else {
                    reasoning
                };
                if let Some(content) = take_content(&mut json) {
                    // Reasoning and answer in one delta: close the tag here.
                    if let Some((prev, prev_json)) = self.held.take() {
                        out.push(prev.with_data(prev_json.to_string()).encode());
                    }
                    set_content(&mut json, format!("{text}{THINK_CLOSE}{content}"));
                    out.push(event.with_data(json.to_string()).encode());
                    self.state = ThinkState::Passthrough;
                    return;
                }
                set_content(&mut json, text);
                self.state = ThinkState::Thinking;
                if let Some((prev, prev_json)) = self.held.replace((event, json)) {
                    out.push(prev.with_data(prev_json.to_string()).encode());
                }
            }
            None if self.state == ThinkState::Pending && is_preamble(&json) => {
                out.push(event.encode());
            }
            None => {
                self.finalize(out);
                out.push(event.encode());
            }
        }
    }

    /// Close the tag on the held event, emit it, switch to passthrough.
    fn finalize(&mut self, out: &mut Vec<String>) {
        if let Some((event, mut json)) = self.held.take() {
            let content = delta(&json)
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            set_content(&mut json, format!("{content}{THINK_CLOSE}"));
            out.push(event.with_data(json.to_string()).encode());
        }
        self.state = ThinkState::Passthrough;
    }
}

impl ChunkTransform for ReasoningToThinkTag {
    fn transform(&mut self, chunk: &str, out: &mut Vec<String>) {
        if self.state == ThinkState::Passthrough {
            out.push(chunk.to_string());
            return;
        }
        for event in self.parser.feed(chunk) {
            self.on_event(event, out);
        }
        if self.state == ThinkState::Passthrough {
            let rest = self.parser.take_remaining();
            if !rest.is_empty() {
                out.push(rest);
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<String>) {
        if self.state == ThinkState::Passthrough {
            let rest = self.parser.take_remaining();
            if !rest.is_empty() {
                out.push(rest);
            }
            return;
        }
        for event in self.parser.finish() {
            self.on_event(event, out);
        }
        self.finalize(out);
    }
}

fn delta(json: &Value) -> Option<&Value> {
    json.get("choices")?.get(0)?.get("delta")
}

fn delta_mut(json: &mut Value) -> Option<&mut serde_json::Map<String, Value>> {
    json.get_mut("choices")?
        .get_mut(0)?
        .get_mut("delta")?
        .as_object_mut()
}

/// Remove both reasoning fields, returning the text when non-empty.
fn take_reasoning(json: &mut Value) -> Option<String> {
    let delta = delta_mut(json)?;
    let text = ["reasoning_content", "reasoning"]
        .iter()
        .filter_map(|k| delta.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)?;
    delta.remove("reasoning_content");
    delta.remove("reasoning");
    Some(text)
}

/// Non-empty visible content of the delta, removed from it.
fn take_content(json: &mut Value) -> Option<String> {
    let delta = delta_mut(json)?;
    let text = delta
        .get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?
        .to_string();
    delta.remove("content");
    Some(text)
}

fn set_content(json: &mut Value, text: String) {
    if let Some(delta) = delta_mut(json) {
        delta.insert("content".into(), Value::String(text));
    }
}

/// Role-only or empty chunks that may precede the reasoning run.
fn is_preamble(json: &Value) -> bool {
    match delta(json) {
        None => json.get("choices").is_some(),
        Some(d) => {
            d.get("tool_calls").is_none()
                && d
                    .get("content")
                    .map(|c| c.is_null() || c.as_str() == Some(""))
                    .unwrap_or(true)
        }
    }
}
