use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode};
use serde_json::Value;

use super::{Hook, HookContext};
use crate::context::RequestEnv;
use crate::exchange::{ProxyRequest, ProxyResponse};
use crate::protocol::ollama::openai_models_to_ollama;
use crate::protocol::{MODELS_PATH, OLLAMA_TAGS_PATH};

pub const NAME: &str = "ollama-to-openai";

/// Lets an OpenAI-compatible upstream answer Ollama's `/api/tags`.
#[derive(Debug, Default)]
pub struct OllamaToOpenAI;

impl OllamaToOpenAI {
    pub fn factory(_config: &Value) -> anyhow::Result<Arc<dyn Hook>> {
        Ok(Arc::new(OllamaToOpenAI))
    }
}

fn models_to_tags(response: ProxyResponse) -> ProxyResponse {
    if response.status != StatusCode::OK {
        return response;
    }
    response.map_full_body(|bytes| match serde_json::from_slice::<Value>(&bytes) {
        Ok(v) => serde_json::to_vec(&openai_models_to_ollama(&v))
            .map(Bytes::from)
            .unwrap_or(bytes),
        Err(e) => {
            tracing::warn!("Upstream model list is not JSON: {}", e);
            bytes
        }
    })
}

impl Hook for OllamaToOpenAI {
    fn name(&self) -> &str {
        NAME
    }

    fn on_request(
        &self,
        mut request: ProxyRequest,
        _env: &RequestEnv,
        ctx: &mut HookContext,
    ) -> anyhow::Result<ProxyRequest> {
        if request.method != Method::GET || !request.path().ends_with(OLLAMA_TAGS_PATH) {
            return Ok(request);
        }
        let path = request.path();
        let mount = &path[..path.len() - OLLAMA_TAGS_PATH.len()];
        let models_path = format!("{mount}{MODELS_PATH}");
        request.set_path(&models_path);
        ctx.add_response(models_to_tags);
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::hooks::HookRunner;
    use serde_json::json;

    fn env() -> RequestEnv {
        RequestEnv::with_breaker(Arc::new(CircuitBreaker::new()))
    }

    #[tokio::test]
    async fn tags_request_is_served_from_model_list() {
        let mut runner = HookRunner::new(vec![OllamaToOpenAI::factory(&Value::Null).unwrap()]);
        let req = runner.run_request(ProxyRequest::new(Method::GET, "/api/tags"), &env());
        assert_eq!(req.uri, "/v1/models");

        let upstream = ProxyResponse::json(
            StatusCode::OK,
            &json!({"object": "list", "data": [{"id": "qwen3", "created": 0}]}),
        );
        let out = runner.run_response(upstream);
        let body: Value = serde_json::from_slice(&out.body.collect().await.unwrap()).unwrap();
        assert_eq!(body["models"][0]["name"], "qwen3");
        assert_eq!(body["models"][0]["modified_at"], "1970-01-01T00:00:00.000Z");
    }

    #[tokio::test]
    async fn non_200_model_list_is_untouched() {
        let out = models_to_tags(ProxyResponse::error(StatusCode::UNAUTHORIZED, "no key"));
        assert_eq!(out.status, StatusCode::UNAUTHORIZED);
        let body: Value = serde_json::from_slice(&out.body.collect().await.unwrap()).unwrap();
        assert_eq!(body["error"]["message"], "no key");
    }

    #[test]
    fn other_requests_pass_through() {
        let mut ctx = HookContext::default();
        let req = ProxyRequest::new(Method::POST, "/api/tags");
        let out = OllamaToOpenAI.on_request(req, &env(), &mut ctx).unwrap();
        assert_eq!(out.uri, "/api/tags");
        assert!(ctx.is_empty());
    }
}
