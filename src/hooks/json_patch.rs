//! Applies configured RFC 6902 patch documents to JSON request bodies.

use std::sync::Arc;

use anyhow::{bail, Context};
use json_patch::{Patch, PatchErrorKind};
use serde_json::Value;

use super::{Hook, HookContext};
use crate::context::RequestEnv;
use crate::exchange::ProxyRequest;

pub const NAME: &str = "json-patch-request";

/// Config: `{"<label>": [operations...], ...}`. Documents apply in sorted label
/// order, each on the result of the previous one. A document whose `test`
/// operation fails is skipped as a whole; any other failure leaves the
/// request untouched.
#[derive(Debug, Default)]
pub struct JsonPatchRequest {
    patches: Vec<(String, Patch)>,
}

impl JsonPatchRequest {
    pub fn new(patches: Vec<(String, Patch)>) -> Self {
        Self { patches }
    }

    pub fn factory(config: &Value) -> anyhow::Result<Arc<dyn Hook>> {
        let patches = match config {
            Value::Null => Vec::new(),
            Value::Object(map) => map
                .iter()
                .map(|(label, ops)| {
                    serde_json::from_value::<Patch>(ops.clone())
                        .with_context(|| format!("patch document '{label}'"))
                        .map(|patch| (label.clone(), patch))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            other => bail!("expected an object of patch documents, got {other}"),
        };
        Ok(Arc::new(Self::new(patches)))
    }
}

impl Hook for JsonPatchRequest {
    fn name(&self) -> &str {
        NAME
    }

    fn on_request(
        &self,
        mut request: ProxyRequest,
        env: &RequestEnv,
        _ctx: &mut HookContext,
    ) -> anyhow::Result<ProxyRequest> {
        if self.patches.is_empty() || !request.is_json() {
            return Ok(request);
        }
        let mut document = request
            .json_body()
            .context("request body is not valid JSON")?;

        let mut changed = false;
        for (label, patch) in &self.patches {
            let mut candidate = document.clone();
            match json_patch::patch(&mut candidate, patch) {
                Ok(()) => {
                    document = candidate;
                    changed = true;
                }
                Err(e) if matches!(e.kind, PatchErrorKind::TestFailed) => {
                    tracing::debug!(
                        request_id = %env.request_id,
                        "Patch '{}' skipped: {}",
                        label,
                        e
                    );
                }
                Err(e) => return Err(e).with_context(|| format!("applying patch '{label}'")),
            }
        }

        if changed {
            request.set_json_body(&document);
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::config::HookSpec;
    use crate::error::GatewayError;
    use crate::hooks::{HookRegistry, HookRunner};
    use bytes::Bytes;
    use http::{header, HeaderValue, Method};
    use serde_json::json;

    fn env() -> RequestEnv {
        RequestEnv::with_breaker(Arc::new(CircuitBreaker::new()))
    }

    fn hook(config: Value) -> Arc<dyn Hook> {
        JsonPatchRequest::factory(&config).unwrap()
    }

    fn chat() -> ProxyRequest {
        ProxyRequest::new(Method::POST, "/v1/chat/completions").with_json(&json!({
            "model": "qwen3",
            "messages": [],
            "top_k": 20
        }))
    }

    #[test]
    fn applies_documents_in_order() {
        let hook = hook(json!({
            "a-defaults": [
                {"op": "add", "path": "/temperature", "value": 0.2},
                {"op": "remove", "path": "/top_k"}
            ],
            "b-override": [{"op": "replace", "path": "/temperature", "value": 0.7}]
        }));
        let out = hook
            .on_request(chat(), &env(), &mut HookContext::default())
            .unwrap();
        let body = out.json_body().unwrap();
        assert_eq!(body["temperature"], 0.7);
        assert!(body.get("top_k").is_none());
        assert_eq!(body["model"], "qwen3");
    }

    #[test]
    fn failed_test_skips_only_that_document() {
        let hook = hook(json!({
            "guarded": [
                {"op": "test", "path": "/model", "value": "gpt-4o"},
                {"op": "add", "path": "/guarded", "value": true}
            ],
            "plain": [{"op": "add", "path": "/plain", "value": 1}]
        }));
        let body = hook
            .on_request(chat(), &env(), &mut HookContext::default())
            .unwrap()
            .json_body()
            .unwrap();
        assert!(body.get("guarded").is_none());
        assert_eq!(body["plain"], 1);
    }

    #[test]
    fn only_failed_tests_leave_body_bytes_alone() {
        let hook = hook(json!({
            "guarded": [
                {"op": "test", "path": "/model", "value": "gpt-4o"},
                {"op": "remove", "path": "/messages"}
            ]
        }));
        let original = chat();
        let out = hook
            .on_request(original.clone(), &env(), &mut HookContext::default())
            .unwrap();
        assert_eq!(out.body, original.body);
    }

    #[test]
    fn non_json_body_passes_through() {
        let hook = hook(json!({"x": [{"op": "add", "path": "/x", "value": 1}]}));
        let mut req = ProxyRequest::new(Method::POST, "/v1/chat/completions");
        req.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        req.body = Bytes::from_static(b"{\"model\":\"m\"}");
        let out = hook
            .on_request(req.clone(), &env(), &mut HookContext::default())
            .unwrap();
        assert_eq!(out.body, req.body);
    }

    #[test]
    fn broken_patch_leaves_request_untouched() {
        let mut runner = HookRunner::new(vec![hook(json!({
            "bad": [
                {"op": "add", "path": "/first", "value": 1},
                {"op": "remove", "path": "/missing"}
            ]
        }))]);
        let original = chat();
        let out = runner.run_request(original.clone(), &env());
        assert_eq!(out.body, original.body);
    }

    #[test]
    fn invalid_config_is_rejected_at_resolve_time() {
        let registry = HookRegistry::builtin();
        let spec = HookSpec::Configured {
            name: NAME.to_string(),
            config: json!({"bad": [{"op": "frobnicate", "path": "/x"}]}),
        };
        assert!(matches!(
            registry.resolve(&spec),
            Err(GatewayError::InvalidConfig(_))
        ));
        assert!(JsonPatchRequest::factory(&json!(["not", "an", "object"])).is_err());
        assert!(JsonPatchRequest::factory(&Value::Null).is_ok());
    }
}
