//! Hooks for talking to Claude-style upstreams.

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use serde_json::{json, Value};

use super::{Hook, HookContext};
use crate::context::RequestEnv;
use crate::exchange::{ProxyRequest, ProxyResponse};
use crate::protocol::claude::{
    claude_response_to_openai, default_system_block, openai_request_to_claude,
    ClaudeToOpenAIStream,
};
use crate::protocol::{CHAT_COMPLETIONS_PATH, MESSAGES_PATH};
use crate::stream::transform_body;

pub const OPENAI_TO_CLAUDE: &str = "openai-to-claude";
pub const SIMULATE_CLAUDE_CODE_CLIENT: &str = "simulate-claude-code-client";

const ANTHROPIC_VERSION: &str = "anthropic-version";
const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Serves OpenAI chat-completions callers from a Claude messages upstream.
#[derive(Debug, Default)]
pub struct OpenAIToClaude;

impl OpenAIToClaude {
    pub fn factory(_config: &Value) -> anyhow::Result<Arc<dyn Hook>> {
        Ok(Arc::new(OpenAIToClaude))
    }
}

/// Claude response (JSON or event stream) -> OpenAI response. Error
/// responses and anything unparseable pass through untouched.
pub fn convert_claude_response(response: ProxyResponse) -> ProxyResponse {
    if !response.status.is_success() {
        return response;
    }
    if response.is_event_stream() {
        return response.map_stream(|body| transform_body(body, ClaudeToOpenAIStream::new()));
    }
    if response.is_json() {
        return response.map_full_body(|bytes| {
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(v) => serde_json::to_vec(&claude_response_to_openai(&v))
                    .map(Bytes::from)
                    .unwrap_or(bytes),
                Err(e) => {
                    tracing::warn!("Passing through unparseable Claude response: {}", e);
                    bytes
                }
            }
        });
    }
    response
}

impl Hook for OpenAIToClaude {
    fn name(&self) -> &str {
        OPENAI_TO_CLAUDE
    }

    fn on_request(
        &self,
        mut request: ProxyRequest,
        _env: &RequestEnv,
        ctx: &mut HookContext,
    ) -> anyhow::Result<ProxyRequest> {
        if !request.is_post_to(CHAT_COMPLETIONS_PATH) {
            return Ok(request);
        }
        let body = request
            .json_body()
            .context("chat completions body is not JSON")?;

        let path = request.path();
        let mount = &path[..path.len() - CHAT_COMPLETIONS_PATH.len()];
        let messages_path = format!("{mount}{MESSAGES_PATH}");
        request.set_path(&messages_path);
        request.set_json_body(&openai_request_to_claude(&body));
        if !request.headers.contains_key(ANTHROPIC_VERSION) {
            request.headers.insert(
                ANTHROPIC_VERSION,
                HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION),
            );
        }

        ctx.add_response(convert_claude_response);
        Ok(request)
    }
}

/// Makes requests look like they come from the Claude Code CLI.
#[derive(Debug, Default)]
pub struct SimulateClaudeCodeClient;

impl SimulateClaudeCodeClient {
    pub fn factory(_config: &Value) -> anyhow::Result<Arc<dyn Hook>> {
        Ok(Arc::new(SimulateClaudeCodeClient))
    }
}

const CLIENT_HEADER_DEFAULTS: [(&str, &str); 3] = [
    (
        "anthropic-beta",
        "claude-code-20250219,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14",
    ),
    ("anthropic-dangerous-direct-browser-access", "true"),
    (ANTHROPIC_VERSION, DEFAULT_ANTHROPIC_VERSION),
];

fn ensure_claude_code_system(body: &mut Value) {
    let mut system = match body.get("system") {
        Some(Value::String(text)) => vec![json!({ "type": "text", "text": text })],
        Some(Value::Array(blocks)) => blocks.clone(),
        _ => Vec::new(),
    };
    let has_prompt = system
        .first()
        .and_then(|b| b.get("text"))
        .and_then(Value::as_str)
        .map(|t| t.contains("You are Claude Code"))
        .unwrap_or(false);
    if !has_prompt {
        system.insert(0, default_system_block());
    }
    body["system"] = Value::Array(system);
}

impl Hook for SimulateClaudeCodeClient {
    fn name(&self) -> &str {
        SIMULATE_CLAUDE_CODE_CLIENT
    }

    fn on_request(
        &self,
        mut request: ProxyRequest,
        _env: &RequestEnv,
        _ctx: &mut HookContext,
    ) -> anyhow::Result<ProxyRequest> {
        request.headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("claude-cli/1.0.69 (external, cli)"),
        );
        for (name, value) in CLIENT_HEADER_DEFAULTS {
            if !request.headers.contains_key(name) {
                request.headers.insert(name, HeaderValue::from_static(value));
            }
        }

        if request.path().ends_with(MESSAGES_PATH) {
            let mut body = request.json_body().context("messages body is not JSON")?;
            ensure_claude_code_system(&mut body);
            request.set_json_body(&body);
        }
        Ok(request)
    }
}
