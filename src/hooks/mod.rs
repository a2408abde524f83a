//! Request/response hook pipeline.
//!
//! A [`Hook`] rewrites the outgoing request and may register deferred
//! response handlers on the [`HookContext`]. Handlers registered while one
//! request passed through the pipeline run on that request's response only,
//! last registered first.
//!
//! Hooks are looked up by name in a static [`HookRegistry`] when the
//! configuration is loaded, never per request.

pub mod claude;
pub mod cursor;
pub mod json_patch;
pub mod ollama;
pub mod think;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::HookSpec;
use crate::context::RequestEnv;
use crate::error::GatewayError;
use crate::exchange::{ProxyRequest, ProxyResponse};

pub type ResponseHandler = Box<dyn FnOnce(ProxyResponse) -> ProxyResponse + Send>;

/// Collects deferred response handlers for one request.
#[derive(Default)]
pub struct HookContext {
    handlers: Vec<ResponseHandler>,
}

impl HookContext {
    pub fn add_response<F>(&mut self, handler: F)
    where
        F: FnOnce(ProxyResponse) -> ProxyResponse + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Return the (possibly rewritten) request. An error leaves the request
    /// as it was before this hook and discards anything it registered.
    fn on_request(
        &self,
        request: ProxyRequest,
        env: &RequestEnv,
        ctx: &mut HookContext,
    ) -> anyhow::Result<ProxyRequest>;
}

/// Runs one ordered hook list over a single request/response pair.
pub struct HookRunner {
    hooks: Vec<Arc<dyn Hook>>,
    ctx: HookContext,
}

impl HookRunner {
    pub fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        Self {
            hooks,
            ctx: HookContext::default(),
        }
    }

    pub fn run_request(&mut self, request: ProxyRequest, env: &RequestEnv) -> ProxyRequest {
        let mut current = request;
        for hook in &self.hooks {
            let mark = self.ctx.handlers.len();
            match hook.on_request(current.clone(), env, &mut self.ctx) {
                Ok(next) => current = next,
                Err(e) => {
                    tracing::warn!(
                        request_id = %env.request_id,
                        "Hook '{}' failed, passing request through: {:#}",
                        hook.name(),
                        e
                    );
                    self.ctx.handlers.truncate(mark);
                }
            }
        }
        current
    }

    /// Apply deferred handlers in reverse registration order.
    pub fn run_response(self, response: ProxyResponse) -> ProxyResponse {
        self.ctx
            .handlers
            .into_iter()
            .rev()
            .fold(response, |resp, handler| handler(resp))
    }
}

pub type HookFactory = fn(&Value) -> anyhow::Result<Arc<dyn Hook>>;

/// Name -> constructor table for the hooks this binary knows about.
#[derive(Clone)]
pub struct HookRegistry {
    factories: BTreeMap<String, HookFactory>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl HookRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(cursor::NAME, cursor::CursorCompatible::factory);
        registry.register(think::NAME, think::ReasoningToThink::factory);
        registry.register(claude::OPENAI_TO_CLAUDE, claude::OpenAIToClaude::factory);
        registry.register(
            claude::SIMULATE_CLAUDE_CODE_CLIENT,
            claude::SimulateClaudeCodeClient::factory,
        );
        registry.register(ollama::NAME, ollama::OllamaToOpenAI::factory);
        registry.register(json_patch::NAME, json_patch::JsonPatchRequest::factory);
        registry
    }

    pub fn register(&mut self, name: &str, factory: HookFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn resolve(&self, spec: &HookSpec) -> Result<Arc<dyn Hook>, GatewayError> {
        let factory = self
            .factories
            .get(spec.name())
            .ok_or_else(|| {
                GatewayError::UnknownHook(format!(
                    "'{}' (known: {})",
                    spec.name(),
                    self.names().collect::<Vec<_>>().join(", ")
                ))
            })?;
        factory(&spec.config()).map_err(|e| {
            GatewayError::InvalidConfig(format!("hook '{}': {:#}", spec.name(), e))
        })
    }

    pub fn resolve_all(&self, specs: &[HookSpec]) -> Result<Vec<Arc<dyn Hook>>, GatewayError> {
        specs.iter().map(|spec| self.resolve(spec)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use http::{HeaderValue, Method, StatusCode};

    struct Tag(&'static str);

    impl Hook for Tag {
        fn name(&self) -> &str {
            self.0
        }

        fn on_request(
            &self,
            mut request: ProxyRequest,
            _env: &RequestEnv,
            ctx: &mut HookContext,
        ) -> anyhow::Result<ProxyRequest> {
            let tag = self.0;
            request.uri.push_str(tag);
            ctx.add_response(move |mut resp| {
                let seen = resp
                    .headers
                    .get("x-order")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if let Ok(v) = HeaderValue::from_str(&format!("{seen}{tag}")) {
                    resp.headers.insert("x-order", v);
                }
                resp
            });
            Ok(request)
        }
    }

    struct Broken;

    impl Hook for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn on_request(
            &self,
            mut request: ProxyRequest,
            _env: &RequestEnv,
            ctx: &mut HookContext,
        ) -> anyhow::Result<ProxyRequest> {
            request.uri.push_str("!");
            ctx.add_response(|mut resp| {
                resp.status = StatusCode::IM_A_TEAPOT;
                resp
            });
            anyhow::bail!("boom")
        }
    }

    fn env() -> RequestEnv {
        RequestEnv::with_breaker(Arc::new(CircuitBreaker::new()))
    }

    #[test]
    fn request_order_forward_response_order_reversed() {
        let mut runner = HookRunner::new(vec![Arc::new(Tag("a")), Arc::new(Tag("b"))]);
        let req = runner.run_request(ProxyRequest::new(Method::GET, "/x"), &env());
        assert_eq!(req.uri, "/xab");
        let resp = runner.run_response(ProxyResponse::error(StatusCode::OK, ""));
        assert_eq!(resp.headers.get("x-order").unwrap(), "ba");
    }

    #[test]
    fn failing_hook_is_skipped_with_its_handlers() {
        let mut runner = HookRunner::new(vec![Arc::new(Tag("a")), Arc::new(Broken)]);
        let req = runner.run_request(ProxyRequest::new(Method::GET, "/x"), &env());
        assert_eq!(req.uri, "/xa");
        let resp = runner.run_response(ProxyResponse::error(StatusCode::OK, ""));
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.headers.get("x-order").unwrap(), "a");
    }

    #[test]
    fn registry_resolves_builtins_and_rejects_unknown() {
        let registry = HookRegistry::builtin();
        for name in [
            "cursor-compatible",
            "reasoning-to-think",
            "openai-to-claude",
            "simulate-claude-code-client",
            "ollama-to-openai",
            "json-patch-request",
        ] {
            let hook = registry.resolve(&HookSpec::from(name)).unwrap();
            assert_eq!(hook.name(), name);
        }
        match registry.resolve(&HookSpec::from("no-such-hook")) {
            Err(GatewayError::UnknownHook(msg)) => {
                assert!(msg.starts_with("'no-such-hook'"));
                assert!(msg.contains("cursor-compatible"));
            }
            other => panic!("expected UnknownHook, got {:?}", other.map(|h| h.name().to_string())),
        }
    }
}
