//! Reasoning shown as inline `<think>` text for clients that expect the
//! tagged convention instead of `reasoning_content`.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;

use super::{Hook, HookContext};
use crate::context::RequestEnv;
use crate::exchange::{ProxyRequest, ProxyResponse};
use crate::protocol::CHAT_COMPLETIONS_PATH;
use crate::registry::glob_match;
use crate::stream::think_tag::{THINK_CLOSE, THINK_OPEN};
use crate::stream::{transform_body, ReasoningToThinkTag};

pub const NAME: &str = "reasoning-to-think";

/// Presents `reasoning_content` as inline `<think>` text to the caller and
/// removes echoed think blocks from the conversation history it sends back.
///
/// Config: optional list of model globs; empty applies to every model.
#[derive(Debug, Default)]
pub struct ReasoningToThink {
    models: Vec<String>,
}

impl ReasoningToThink {
    pub fn new(models: Vec<String>) -> Self {
        Self { models }
    }

    pub fn factory(config: &Value) -> anyhow::Result<Arc<dyn Hook>> {
        let models = match config {
            Value::Null => Vec::new(),
            other => serde_json::from_value(other.clone())
                .context("expected a list of model glob patterns")?,
        };
        Ok(Arc::new(Self::new(models)))
    }

    fn is_model_matched(&self, model: Option<&str>) -> bool {
        if self.models.is_empty() {
            return true;
        }
        match model {
            Some(model) => self.models.iter().any(|p| glob_match(p, model)),
            None => false,
        }
    }
}

fn wrap_stream(response: ProxyResponse) -> ProxyResponse {
    if !response.is_event_stream() {
        return response;
    }
    response.map_stream(|body| transform_body(body, ReasoningToThinkTag::new()))
}

/// Drop a leading `<think>...</think>` span from assistant string messages.
/// Returns whether anything changed.
fn strip_think_blocks(body: &mut Value) -> bool {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return false;
    };
    let mut changed = false;
    for message in messages {
        if message.get("role").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(content) = message.get("content").and_then(Value::as_str) else {
            continue;
        };
        if !content.starts_with(THINK_OPEN) {
            continue;
        }
        if let Some(end) = content.find(THINK_CLOSE) {
            let rest = content[end + THINK_CLOSE.len()..].to_string();
            message["content"] = Value::String(rest);
            changed = true;
        }
    }
    changed
}

impl Hook for ReasoningToThink {
    fn name(&self) -> &str {
        NAME
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
        let mut body = request
            .json_body()
            .context("chat completions body is not JSON")?;
        if !self.is_model_matched(body.get("model").and_then(Value::as_str)) {
            return Ok(request);
        }

        ctx.add_response(wrap_stream);
        if strip_think_blocks(&mut body) {
            request.set_json_body(&body);
        }
        Ok(request)
    }
}
