//! Compatibility fixes for Cursor-style OpenAI clients.

use std::sync::Arc;

use serde_json::{json, Value};

use super::{Hook, HookContext};
use crate::context::RequestEnv;
use crate::exchange::{ProxyRequest, ProxyResponse};
use crate::protocol::CHAT_COMPLETIONS_PATH;
use crate::stream::{combine_finish_chunk, finish_reason_cleaner, transform_body};

pub const NAME: &str = "cursor-compatible";

/// Streams: drop `"finish_reason":null` and collapse the tail into one
/// finish event plus `[DONE]`. Requests for `gpt-5` get the parameter
/// names that model accepts.
#[derive(Debug, Default)]
pub struct CursorCompatible;

impl CursorCompatible {
    pub fn factory(_config: &Value) -> anyhow::Result<Arc<dyn Hook>> {
        Ok(Arc::new(CursorCompatible))
    }
}

pub fn patch_stream(response: ProxyResponse) -> ProxyResponse {
    if !response.is_event_stream() {
        return response;
    }
    response.map_stream(|body| {
        transform_body(
            transform_body(body, finish_reason_cleaner()),
            combine_finish_chunk(),
        )
    })
}

impl Hook for CursorCompatible {
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

        ctx.add_response(patch_stream);

        let Some(mut body) = request.json_body() else {
            return Ok(request);
        };
        if body.get("model").and_then(Value::as_str) == Some("gpt-5") {
            if let Some(max) = body.as_object_mut().and_then(|o| o.remove("max_tokens")) {
                body["max_completion_tokens"] = max;
            }
            body["temperature"] = json!(1);
            request.set_json_body(&body);
        }
        Ok(request)
    }
}
