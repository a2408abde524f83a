//! Inbound endpoint surfaces.
//!
//! Each endpoint is mounted under a prefix and speaks one protocol. The
//! prefix is stripped before forwarding; the longest matching prefix wins.
//!
//! | protocol | route                     | handling                          |
//! |----------|---------------------------|-----------------------------------|
//! | openai   | `POST /v1/chat/completions` | routed by (openai, model)       |
//! | claude   | `POST /v1/messages`       | routed by (claude, model)         |
//! | ollama   | `GET /api/tags`           | fan-out to all matches, merged    |
//! | ollama   | `POST /api/show`          | static capability descriptor      |
//! | ollama   | `GET /api/version`        | static version                    |
//! | any      | anything else             | first match for (protocol, none)  |

use std::sync::Arc;

use futures::future::join_all;
use http::{Method, StatusCode};
use serde_json::Value;

use crate::balancer::LoadBalancer;
use crate::config::GatewayConfig;
use crate::context::RequestEnv;
use crate::error::GatewayError;
use crate::exchange::{ProxyRequest, ProxyResponse};
use crate::hooks::{Hook, HookRegistry};
use crate::protocol::ollama::{merge_tags, show_response, version_response};
use crate::protocol::{
    Protocol, CHAT_COMPLETIONS_PATH, MESSAGES_PATH, OLLAMA_SHOW_PATH, OLLAMA_TAGS_PATH,
    OLLAMA_VERSION_PATH,
};
use crate::registry::UpstreamRegistry;
use crate::upstream::UpstreamTarget;

/// Version reported on `/api/version`; Ollama clients gate features on it.
pub const OLLAMA_COMPAT_VERSION: &str = "0.9.0";

enum Route {
    ByModel,
    Tags,
    Show,
    Version,
    Remaining,
}

pub struct Endpoint {
    protocol: Protocol,
    prefix: String,
    balancer: LoadBalancer,
    registry: Arc<UpstreamRegistry>,
}

impl Endpoint {
    pub fn new(
        protocol: Protocol,
        prefix: impl Into<String>,
        interceptors: Vec<Arc<dyn Hook>>,
        registry: Arc<UpstreamRegistry>,
    ) -> Self {
        Self {
            protocol,
            prefix: prefix.into(),
            balancer: LoadBalancer::new(interceptors),
            registry,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Remove the mount prefix, keeping the query string.
    pub fn strip_prefix(&self, request: &mut ProxyRequest) {
        if self.prefix.is_empty() {
            return;
        }
        let stripped = match request.path().strip_prefix(self.prefix.as_str()) {
            Some("") => "/".to_string(),
            Some(rest) => rest.to_string(),
            None => return,
        };
        request.set_path(&stripped);
    }

    /// Serve an already prefix-stripped request. Failures become JSON error
    /// responses carrying the error's status.
    pub async fn handle(&self, request: ProxyRequest, env: &RequestEnv) -> ProxyResponse {
        match self.dispatch(request, env).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(request_id = %env.request_id, "{}", e);
                ProxyResponse::error(e.status(), &e.to_string())
            }
        }
    }

    fn route_for(&self, request: &ProxyRequest) -> Route {
        let path = request.path();
        let method = &request.method;
        match self.protocol {
            Protocol::Openai if *method == Method::POST && path == CHAT_COMPLETIONS_PATH => {
                Route::ByModel
            }
            Protocol::Claude if *method == Method::POST && path == MESSAGES_PATH => Route::ByModel,
            Protocol::Ollama if *method == Method::GET && path == OLLAMA_TAGS_PATH => Route::Tags,
            Protocol::Ollama if *method == Method::POST && path == OLLAMA_SHOW_PATH => Route::Show,
            Protocol::Ollama if *method == Method::GET && path == OLLAMA_VERSION_PATH => {
                Route::Version
            }
            _ => Route::Remaining,
        }
    }

    async fn dispatch(
        &self,
        request: ProxyRequest,
        env: &RequestEnv,
    ) -> Result<ProxyResponse, GatewayError> {
        match self.route_for(&request) {
            Route::ByModel => self.forward_by_model(request, env).await,
            Route::Tags => self.ollama_tags(request, env).await,
            Route::Show => Ok(ProxyResponse::json(StatusCode::OK, &show_response())),
            Route::Version => Ok(ProxyResponse::json(
                StatusCode::OK,
                &version_response(OLLAMA_COMPAT_VERSION),
            )),
            Route::Remaining => self.forward_remaining(request, env).await,
        }
    }

    async fn forward_by_model(
        &self,
        request: ProxyRequest,
        env: &RequestEnv,
    ) -> Result<ProxyResponse, GatewayError> {
        let body = request
            .json_body()
            .ok_or_else(|| GatewayError::InvalidRequest("request body is not JSON".into()))?;
        let model = body.get("model").and_then(Value::as_str);
        tracing::debug!(request_id = %env.request_id, "{} request for model {:?}", self.protocol, model);

        let candidates = self.registry.find_all(Some(self.protocol), model);
        if candidates.is_empty() {
            return Err(GatewayError::UpstreamNotFound(format!(
                "protocol={} model={}",
                self.protocol,
                model.unwrap_or("any")
            )));
        }
        self.balancer.forward(candidates, request, env).await
    }

    async fn forward_remaining(
        &self,
        request: ProxyRequest,
        env: &RequestEnv,
    ) -> Result<ProxyResponse, GatewayError> {
        let target = self.registry.find(Some(self.protocol), None)?;
        self.balancer.forward(vec![target], request, env).await
    }

    async fn fetch_tags(
        &self,
        target: &UpstreamTarget,
        request: ProxyRequest,
        env: &RequestEnv,
    ) -> Result<Value, GatewayError> {
        let response = target
            .handle(request, env, self.balancer.interceptors())
            .await?;
        if !response.status.is_success() {
            return Err(GatewayError::BadGateway(format!(
                "[{}] answered {}",
                target.name(),
                response.status
            )));
        }
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| GatewayError::BadGateway(format!("[{}] {}", target.name(), e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::BadGateway(format!("[{}] {}", target.name(), e)))
    }

    /// Ask every matching target concurrently; failures are skipped.
    async fn ollama_tags(
        &self,
        request: ProxyRequest,
        env: &RequestEnv,
    ) -> Result<ProxyResponse, GatewayError> {
        let targets = self.registry.find_all(Some(self.protocol), None);
        let results = join_all(
            targets
                .iter()
                .map(|target| self.fetch_tags(target, request.clone(), env)),
        )
        .await;

        let bodies = results.into_iter().filter_map(|result| match result {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::warn!(request_id = %env.request_id, "Skipping tags: {}", e);
                None
            }
        });
        Ok(ProxyResponse::json(StatusCode::OK, &merge_tags(bodies)))
    }
}

/// All configured endpoints, longest prefix first.
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
}

impl EndpointSet {
    pub fn new(mut endpoints: Vec<Endpoint>) -> Self {
        endpoints.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { endpoints }
    }

    /// Global interceptors are prepended to each endpoint's own hooks.
    pub fn from_config(
        config: &GatewayConfig,
        hooks: &HookRegistry,
        registry: Arc<UpstreamRegistry>,
    ) -> Result<Self, GatewayError> {
        let global = hooks.resolve_all(&config.interceptors)?;
        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        for endpoint in &config.endpoints {
            let mut interceptors = global.clone();
            interceptors.extend(hooks.resolve_all(&endpoint.hooks)?);
            tracing::info!(
                "Endpoint {} mounted at '{}' with {} hook(s)",
                endpoint.protocol,
                endpoint.prefix,
                interceptors.len()
            );
            endpoints.push(Endpoint::new(
                endpoint.protocol,
                endpoint.prefix.clone(),
                interceptors,
                registry.clone(),
            ));
        }
        Ok(Self::new(endpoints))
    }

    pub fn route(&self, path: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.matches(path))
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::config::TargetConfig;
    use crate::upstream::mock::MockTransport;
    use serde_json::json;

    fn env() -> RequestEnv {
        RequestEnv::with_breaker(Arc::new(CircuitBreaker::new()))
    }

    fn target(
        name: &str,
        protocols: Vec<Protocol>,
        models: &[&str],
        transport: Arc<MockTransport>,
    ) -> Arc<UpstreamTarget> {
        let mut config = TargetConfig::new(name, format!("http://{name}.test"));
        config.protocols = protocols;
        config.models = models.iter().map(|m| m.to_string()).collect();
        Arc::new(UpstreamTarget::new(config, Vec::new(), transport))
    }

    fn registry(targets: Vec<Arc<UpstreamTarget>>) -> Arc<UpstreamRegistry> {
        Arc::new(UpstreamRegistry::new(targets, Arc::new(CircuitBreaker::new())))
    }

    async fn json_of(resp: ProxyResponse) -> Value {
        serde_json::from_slice(&resp.body.collect().await.unwrap()).unwrap()
    }

    #[test]
    fn longest_prefix_wins_and_is_stripped() {
        let reg = registry(Vec::new());
        let set = EndpointSet::new(vec![
            Endpoint::new(Protocol::Openai, "", Vec::new(), reg.clone()),
            Endpoint::new(Protocol::Ollama, "/ollama", Vec::new(), reg.clone()),
            Endpoint::new(Protocol::Claude, "/ollama/claude", Vec::new(), reg),
        ]);
        assert_eq!(set.route("/ollama/claude/v1/messages").unwrap().protocol(), Protocol::Claude);
        assert_eq!(set.route("/ollama/api/tags").unwrap().protocol(), Protocol::Ollama);
        assert_eq!(set.route("/ollamax/api/tags").unwrap().protocol(), Protocol::Openai);

        let endpoint = set.route("/ollama/api/tags").unwrap();
        let mut req = ProxyRequest::new(Method::GET, "/ollama/api/tags?x=1");
        endpoint.strip_prefix(&mut req);
        assert_eq!(req.uri, "/api/tags?x=1");
        let mut req = ProxyRequest::new(Method::GET, "/ollama");
        endpoint.strip_prefix(&mut req);
        assert_eq!(req.uri, "/");
    }

    #[tokio::test]
    async fn chat_routes_by_model() {
        let gpt = MockTransport::always(200);
        let qwen = MockTransport::always(200);
        let endpoint = Endpoint::new(
            Protocol::Openai,
            "",
            Vec::new(),
            registry(vec![
                target("gpt", vec![Protocol::Openai], &["gpt-*"], gpt.clone()),
                target("qwen", vec![Protocol::Openai], &["qwen*"], qwen.clone()),
            ]),
        );
        let req = ProxyRequest::new(Method::POST, "/v1/chat/completions")
            .with_json(&json!({"model": "qwen3", "messages": []}));
        let resp = endpoint.handle(req, &env()).await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(qwen.calls(), 1);
        assert_eq!(gpt.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_model_is_503_and_bad_body_is_400() {
        let endpoint = Endpoint::new(
            Protocol::Openai,
            "",
            Vec::new(),
            registry(vec![target("gpt", vec![], &["gpt-*"], MockTransport::always(200))]),
        );
        let req = ProxyRequest::new(Method::POST, "/v1/chat/completions")
            .with_json(&json!({"model": "llama3"}));
        let resp = endpoint.handle(req, &env()).await;
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(json_of(resp).await["error"]["message"].is_string());

        let mut req = ProxyRequest::new(Method::POST, "/v1/chat/completions");
        req.body = bytes::Bytes::from_static(b"not json");
        let resp = endpoint.handle(req, &env()).await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ollama_tags_merge_and_skip_failures() {
        let a = MockTransport::json(200, json!({"models": [{"name": "llama3"}, {"name": "qwen3"}]}));
        let b = MockTransport::json(200, json!({"models": [{"name": "llama3", "size": 1}]}));
        let c = MockTransport::always(500);
        let endpoint = Endpoint::new(
            Protocol::Ollama,
            "",
            Vec::new(),
            registry(vec![
                target("a", vec![Protocol::Ollama], &[], a),
                target("b", vec![Protocol::Ollama], &[], b),
                target("c", vec![Protocol::Ollama], &[], c),
            ]),
        );
        let resp = endpoint
            .handle(ProxyRequest::new(Method::GET, "/api/tags"), &env())
            .await;
        let body = json_of(resp).await;
        assert_eq!(body, json!({"models": [{"name": "llama3"}, {"name": "qwen3"}]}));
    }

    #[tokio::test]
    async fn ollama_static_routes() {
        let endpoint = Endpoint::new(Protocol::Ollama, "", Vec::new(), registry(Vec::new()));
        let show = endpoint
            .handle(ProxyRequest::new(Method::POST, "/api/show"), &env())
            .await;
        assert_eq!(json_of(show).await["model_info"]["general.architecture"], "CausalLM");
        let version = endpoint
            .handle(ProxyRequest::new(Method::GET, "/api/version"), &env())
            .await;
        assert_eq!(json_of(version).await["version"], OLLAMA_COMPAT_VERSION);
    }

    #[tokio::test]
    async fn other_paths_pass_through_to_first_match() {
        let t = MockTransport::always(200);
        let endpoint = Endpoint::new(
            Protocol::Claude,
            "",
            Vec::new(),
            registry(vec![target("c", vec![Protocol::Claude], &["claude-*"], t.clone())]),
        );
        let resp = endpoint
            .handle(ProxyRequest::new(Method::GET, "/v1/models?limit=2"), &env())
            .await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(t.seen()[0].0, "http://c.test/v1/models?limit=2");
    }

    #[test]
    fn from_config_resolves_interceptors() {
        let config = GatewayConfig::from_json_str(
            r#"{"interceptors": ["cursor-compatible"],
                "endpoints": [{"type": "openai", "prefix": "/v", "hooks": ["reasoning-to-think"]}]}"#,
        )
        .unwrap();
        let set = EndpointSet::from_config(&config, &HookRegistry::builtin(), registry(Vec::new()))
            .unwrap();
        let endpoint = set.route("/v/v1/models").unwrap();
        let names: Vec<&str> = endpoint.balancer.interceptors().iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["cursor-compatible", "reasoning-to-think"]);
    }
}
