//! OpenAI chat-completions <-> Claude messages conversion.
//!
//! Requests go OpenAI -> Claude; responses come back Claude -> OpenAI, either
//! as one JSON document or as a live event stream.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::sse::{SseMessage, SseParser};
use crate::stream::ChunkTransform;

/// System prompt Claude Code clients send; some Claude upstreams require it.
pub const CLAUDE_CODE_SYSTEM_PROMPT: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

/// The compatibility system block injected when a request carries none.
pub fn default_system_block() -> Value {
    json!({
        "type": "text",
        "text": CLAUDE_CODE_SYSTEM_PROMPT,
        "cache_control": { "type": "ephemeral" }
    })
}

/// Map a Claude `stop_reason` onto an OpenAI `finish_reason`.
pub fn map_stop_reason(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        // end_turn, stop_sequence, pause_turn, refusal
        _ => "stop",
    }
}

// ============================================================================
// Request conversion
// ============================================================================

/// Convert an OpenAI chat-completions request body into a Claude messages
/// request body.
///
/// - system-role messages -> `system` text blocks (default block if none)
/// - `user` stays `user`, every other role becomes `assistant`
/// - content is coerced to block arrays; non-text parts become
///   `[<type> content]` placeholders
/// - function tools -> `{name, description, input_schema}`
/// - `stop` -> `stop_sequences`
pub fn openai_request_to_claude(v: &Value) -> Value {
    let mut out = Map::new();
    out.insert(
        "model".into(),
        v.get("model").cloned().unwrap_or(Value::String(String::new())),
    );

    let messages = v
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let system: Vec<Value> = messages
        .iter()
        .filter(|m| m.get("role").and_then(Value::as_str) == Some("system"))
        .map(|m| json!({ "type": "text", "text": system_text(m.get("content")) }))
        .collect();
    out.insert(
        "system".into(),
        if system.is_empty() {
            Value::Array(vec![default_system_block()])
        } else {
            Value::Array(system)
        },
    );

    let converted: Vec<Value> = messages
        .iter()
        .filter(|m| m.get("role").and_then(Value::as_str) != Some("system"))
        .map(|m| {
            let role = match m.get("role").and_then(Value::as_str) {
                Some("user") => "user",
                _ => "assistant",
            };
            json!({ "role": role, "content": content_blocks(m.get("content")) })
        })
        .collect();
    out.insert("messages".into(), Value::Array(converted));

    for key in ["temperature", "top_p", "stream"] {
        if let Some(val) = v.get(key).filter(|x| !x.is_null()) {
            out.insert(key.into(), val.clone());
        }
    }
    if let Some(max) = v
        .get("max_tokens")
        .filter(|x| !x.is_null())
        .or_else(|| v.get("max_completion_tokens").filter(|x| !x.is_null()))
    {
        out.insert("max_tokens".into(), max.clone());
    }
    if let Some(tools) = v.get("tools").and_then(Value::as_array) {
        out.insert(
            "tools".into(),
            Value::Array(tools.iter().map(map_tool).collect()),
        );
    }
    match v.get("stop") {
        Some(Value::String(s)) => {
            out.insert("stop_sequences".into(), json!([s]));
        }
        Some(Value::Array(arr)) if !arr.is_empty() => {
            out.insert("stop_sequences".into(), Value::Array(arr.clone()));
        }
        _ => {}
    }

    Value::Object(out)
}

fn system_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .find(|p| p.get("type").and_then(Value::as_str) == Some("text"))
            .and_then(|p| p.get("text").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

fn content_blocks(content: Option<&Value>) -> Value {
    match content {
        Some(Value::String(s)) => json!([{ "type": "text", "text": s }]),
        Some(Value::Array(parts)) => Value::Array(
            parts
                .iter()
                .map(|part| {
                    let kind = part.get("type").and_then(Value::as_str).unwrap_or("unknown");
                    if kind == "text" {
                        json!({
                            "type": "text",
                            "text": part.get("text").and_then(Value::as_str).unwrap_or_default()
                        })
                    } else {
                        json!({ "type": "text", "text": format!("[{kind} content]") })
                    }
                })
                .collect(),
        ),
        _ => json!([]),
    }
}

fn map_tool(tool: &Value) -> Value {
    match tool.get("function") {
        Some(function) if tool.get("type").and_then(Value::as_str) == Some("function") => {
            let mut out = Map::new();
            out.insert(
                "name".into(),
                function.get("name").cloned().unwrap_or(Value::Null),
            );
            if let Some(description) = function.get("description") {
                out.insert("description".into(), description.clone());
            }
            out.insert(
                "input_schema".into(),
                function
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({ "type": "object" })),
            );
            Value::Object(out)
        }
        _ => tool.clone(),
    }
}

// ============================================================================
// Response conversion
// ============================================================================

/// Convert a complete Claude messages response into an OpenAI
/// chat-completion response.
pub fn claude_response_to_openai(v: &Value) -> Value {
    let blocks = v
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let texts: Vec<&str> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();

    let tool_calls: Vec<Value> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
        .map(|b| {
            json!({
                "id": b.get("id").cloned().unwrap_or(Value::Null),
                "type": "function",
                "function": {
                    "name": b.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": b.get("input").map(Value::to_string).unwrap_or_else(|| "{}".into()),
                }
            })
        })
        .collect();

    let mut message = json!({
        "role": "assistant",
        "content": if texts.is_empty() { Value::Null } else { Value::String(texts.concat()) },
        "refusal": null,
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    let stop_reason = v
        .get("stop_reason")
        .and_then(Value::as_str)
        .unwrap_or("end_turn");
    let input = token_count(v.pointer("/usage/input_tokens"));
    let output = token_count(v.pointer("/usage/output_tokens"));

    json!({
        "id": format!("chatcmpl-{}", v.get("id").and_then(Value::as_str).unwrap_or_default()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": v.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": message,
            "logprobs": null,
            "finish_reason": map_stop_reason(stop_reason),
        }],
        "usage": {
            "prompt_tokens": input,
            "completion_tokens": output,
            "total_tokens": input + output,
        }
    })
}

fn token_count(v: Option<&Value>) -> u64 {
    v.and_then(Value::as_u64).unwrap_or(0)
}

// ============================================================================
// Streaming conversion
// ============================================================================

/// Claude message events -> OpenAI chat-completion chunks, one connection at
/// a time.
#[derive(Debug, Default)]
pub struct ClaudeToOpenAIStream {
    parser: SseParser,
    id: Option<String>,
    model: Option<Value>,
    /// Open tool-use blocks keyed by Claude content-block index.
    tool_calls: BTreeMap<u64, ToolCallAccumulator>,
    input_tokens: Option<u64>,
    terminated: bool,
}

#[derive(Debug)]
struct ToolCallAccumulator {
    id: Value,
    name: Value,
    arguments: String,
}

impl ClaudeToOpenAIStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": chrono::Utc::now().timestamp(),
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }]
        })
    }

    fn emit(&self, source: &SseMessage, data: Value, out: &mut Vec<String>) {
        let msg = SseMessage {
            id: source.id.clone(),
            event: None,
            data: data.to_string(),
        };
        out.push(msg.encode());
    }

    fn terminate_with(&mut self, msg: SseMessage, out: &mut Vec<String>) {
        out.push(msg.encode());
        self.terminated = true;
    }

    fn on_event(&mut self, source: SseMessage, out: &mut Vec<String>) {
        if self.terminated {
            return;
        }
        if source.is_done() || source.event.as_deref() == Some("message_stop") {
            let done = SseMessage {
                id: source.id.clone(),
                ..SseMessage::done()
            };
            self.terminate_with(done, out);
            return;
        }
        if source.data.trim().is_empty() {
            return;
        }

        let Some(json) = source.json() else {
            tracing::warn!("Passing through unparseable Claude stream event");
            out.push(source.encode());
            return;
        };

        let kind = json
            .get("type")
            .and_then(Value::as_str)
            .or(source.event.as_deref())
            .unwrap_or_default()
            .to_string();

        if kind == "error" || source.event.as_deref() == Some("error") {
            self.terminate_with(source, out);
            return;
        }

        if kind == "message_start" {
            let message = json.get("message").cloned().unwrap_or(Value::Null);
            self.id = Some(format!(
                "chatcmpl-{}",
                message.get("id").and_then(Value::as_str).unwrap_or_default()
            ));
            self.model = message.get("model").cloned();
            self.input_tokens = message.pointer("/usage/input_tokens").and_then(Value::as_u64);
            let role = message
                .get("role")
                .cloned()
                .unwrap_or_else(|| Value::String("assistant".into()));
            let chunk = self.chunk(json!({ "role": role }), None);
            self.emit(&source, chunk, out);
            return;
        }

        if self.id.is_none() {
            // Nothing can be attributed before message_start.
            return;
        }

        match kind.as_str() {
            "message_stop" => {
                let done = SseMessage {
                    id: source.id.clone(),
                    ..SseMessage::done()
                };
                self.terminate_with(done, out);
            }
            "content_block_start" => {
                let block = json.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let index = json.get("index").and_then(Value::as_u64).unwrap_or(0);
                    self.tool_calls.insert(
                        index,
                        ToolCallAccumulator {
                            id: block.get("id").cloned().unwrap_or(Value::Null),
                            name: block.get("name").cloned().unwrap_or(Value::Null),
                            arguments: String::new(),
                        },
                    );
                }
            }
            "content_block_delta" => {
                let index = json.get("index").and_then(Value::as_u64).unwrap_or(0);
                let delta = json.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("input_json_delta") => {
                        if let Some(call) = self.tool_calls.get_mut(&index) {
                            call.arguments.push_str(
                                delta.get("partial_json").and_then(Value::as_str).unwrap_or(""),
                            );
                        }
                    }
                    Some("text_delta") => {
                        let text = delta.get("text").cloned().unwrap_or(Value::Null);
                        let chunk = self.chunk(json!({ "content": text }), None);
                        self.emit(&source, chunk, out);
                    }
                    Some("thinking_delta") => {
                        let text = delta.get("thinking").cloned().unwrap_or(Value::Null);
                        let chunk = self.chunk(json!({ "reasoning_content": text }), None);
                        self.emit(&source, chunk, out);
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                let Some(stop_reason) = json.pointer("/delta/stop_reason").and_then(Value::as_str)
                else {
                    return;
                };
                let finish = map_stop_reason(stop_reason);
                let delta = if stop_reason == "tool_use" {
                    let calls: Vec<Value> = std::mem::take(&mut self.tool_calls)
                        .into_values()
                        .enumerate()
                        .map(|(i, call)| {
                            json!({
                                "index": i,
                                "id": call.id,
                                "type": "function",
                                "function": { "name": call.name, "arguments": call.arguments }
                            })
                        })
                        .collect();
                    json!({ "tool_calls": calls })
                } else {
                    json!({})
                };
                let mut chunk = self.chunk(delta, Some(finish));
                if let Some(output) = json.pointer("/usage/output_tokens").and_then(Value::as_u64)
                {
                    let input = self.input_tokens.unwrap_or(0);
                    chunk["usage"] = json!({
                        "prompt_tokens": input,
                        "completion_tokens": output,
                        "total_tokens": input + output,
                    });
                }
                self.emit(&source, chunk, out);
            }
            _ => {}
        }
    }
}

impl ChunkTransform for ClaudeToOpenAIStream {
    fn transform(&mut self, chunk: &str, out: &mut Vec<String>) {
        for event in self.parser.feed(chunk) {
            self.on_event(event, out);
            if self.terminated {
                break;
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<String>) {
        for event in self.parser.finish() {
            self.on_event(event, out);
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}
