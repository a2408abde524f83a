//! A configured upstream target and the outbound call to it.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use http::header::{self, HeaderMap, HeaderValue};

use crate::config::TargetConfig;
use crate::context::RequestEnv;
use crate::dump::{dump_request, dump_response, Leg};
use crate::error::GatewayError;
use crate::exchange::{Body, ProxyRequest, ProxyResponse};
use crate::hooks::{Hook, HookRegistry, HookRunner};
use crate::protocol::is_model_bearing;
use crate::util::build_http_client;

/// Sends a fully prepared request. Implementations classify failures:
/// timeouts become [`GatewayError::UpstreamTimeout`], anything else
/// [`GatewayError::BadGateway`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, url: &str, request: ProxyRequest) -> Result<ProxyResponse, GatewayError>;
}

/// reqwest-backed transport; the response body is streamed, not buffered.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn for_target(config: &TargetConfig) -> Result<Self, GatewayError> {
        let client = build_http_client(config.https_proxy.as_deref(), config.timeout_seconds)?;
        Ok(Self::new(client))
    }
}

fn classify(url: &str, err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::UpstreamTimeout(format!("{url}: {err}"))
    } else {
        GatewayError::BadGateway(format!("{url}: {err}"))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, url: &str, request: ProxyRequest) -> Result<ProxyResponse, GatewayError> {
        let response = self
            .client
            .request(request.method, url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        Ok(ProxyResponse::new(status, headers, Body::Stream(body)))
    }
}

/// Hop-level request headers that must not be forwarded. The client
/// negotiates its own `accept-encoding` and decodes the response.
fn strip_request_headers(headers: &mut HeaderMap) {
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONTENT_ENCODING);
    headers.remove(header::ACCEPT_ENCODING);
    let forwarded: Vec<_> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("x-forwarded-"))
        .cloned()
        .collect();
    for name in forwarded {
        headers.remove(name);
    }
}

pub struct UpstreamTarget {
    pub config: TargetConfig,
    hooks: Vec<Arc<dyn Hook>>,
    transport: Arc<dyn Transport>,
    api_key: Option<String>,
}

impl std::fmt::Debug for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTarget")
            .field("name", &self.config.name)
            .field("api_base", &self.config.api_base)
            .field("priority", &self.config.priority)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl UpstreamTarget {
    pub fn new(
        config: TargetConfig,
        hooks: Vec<Arc<dyn Hook>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let api_key = config.resolved_api_key();
        Self {
            config,
            hooks,
            transport,
            api_key,
        }
    }

    /// Resolve the target's hooks and give it its own HTTP client. Fails on
    /// unknown hooks and on a proxy the client cannot use.
    pub fn from_config(config: TargetConfig, registry: &HookRegistry) -> Result<Self, GatewayError> {
        let hooks = registry.resolve_all(&config.hooks)?;
        let transport = Arc::new(ReqwestTransport::for_target(&config)?);
        Ok(Self::new(config, hooks, transport))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn priority(&self) -> i64 {
        self.config.priority
    }

    /// Base path joined with the incoming path and query, exactly one `/`
    /// between them.
    pub fn url_for(&self, uri: &str) -> String {
        let base = self.config.api_base.trim().trim_end_matches('/');
        let incoming = uri.trim_start_matches('/');
        format!("{base}/{incoming}")
    }

    /// Substitute an aliased model name. The body is only re-encoded when a
    /// substitution actually happens.
    fn apply_model_alias(&self, request: &mut ProxyRequest) {
        if self.config.model_aliases.is_empty() || !is_model_bearing(request.path()) {
            return;
        }
        let Some(mut body) = request.json_body() else {
            return;
        };
        let Some(alias) = body
            .get("model")
            .and_then(|m| m.as_str())
            .and_then(|m| self.config.model_aliases.get(m))
            .cloned()
        else {
            return;
        };
        tracing::debug!("[{}] model alias -> {}", self.name(), alias);
        body["model"] = serde_json::Value::String(alias);
        request.set_json_body(&body);
    }

    /// Warn for every failed chunk read; the error itself still flows on.
    fn log_body_errors(&self, response: ProxyResponse, request_id: &str) -> ProxyResponse {
        if !matches!(response.body, Body::Stream(_)) {
            return response;
        }
        let name = self.name().to_string();
        let request_id = request_id.to_string();
        response.map_stream(move |stream| {
            stream
                .inspect(move |chunk| {
                    if let Err(e) = chunk {
                        tracing::warn!(
                            request_id = %request_id,
                            "[{}] upstream body read failed: {}",
                            name,
                            e
                        );
                    }
                })
                .boxed()
        })
    }

    /// Run `request` through `interceptors` then this target's hooks, send
    /// it, and run the response back through the registered handlers.
    pub async fn handle(
        &self,
        request: ProxyRequest,
        env: &RequestEnv,
        interceptors: &[Arc<dyn Hook>],
    ) -> Result<ProxyResponse, GatewayError> {
        let hooks: Vec<Arc<dyn Hook>> = interceptors
            .iter()
            .chain(self.hooks.iter())
            .cloned()
            .collect();
        let mut runner = HookRunner::new(hooks);
        let mut request = runner.run_request(request, env);

        self.apply_model_alias(&mut request);
        let url = self.url_for(&request.uri);
        strip_request_headers(&mut request.headers);
        if let Some(key) = &self.api_key {
            match HeaderValue::from_str(&format!("Bearer {key}")) {
                Ok(value) => {
                    request.headers.insert(header::AUTHORIZATION, value);
                }
                Err(_) => tracing::warn!("[{}] API key is not a valid header value", self.name()),
            }
        }

        dump_request(env.dumper.as_ref(), Leg::Upstream, &url, &request);
        tracing::info!(
            request_id = %env.request_id,
            "Proxying request: [{}] {} {} -> {}",
            self.name(),
            request.method,
            request.path(),
            url
        );

        let response = self.transport.send(&url, request).await?;
        tracing::info!(
            request_id = %env.request_id,
            "Response received from [{}]: {}",
            self.name(),
            response.status
        );

        let response = self.log_body_errors(response, &env.request_id);
        let response = dump_response(env.dumper.clone(), Leg::Upstream, response);
        let mut response = runner.run_response(response);
        response.headers.remove(header::CONTENT_LENGTH);
        response.headers.remove(header::CONTENT_ENCODING);
        Ok(response)
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{MockTransport, Reply};
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::hooks::HookContext;
    use http::{Method, StatusCode};
    use serde_json::{json, Value};

    fn env() -> RequestEnv {
        RequestEnv::with_breaker(Arc::new(CircuitBreaker::new()))
    }

    fn target_with(config: TargetConfig, transport: Arc<MockTransport>) -> UpstreamTarget {
        UpstreamTarget::new(config, Vec::new(), transport)
    }

    #[test]
    fn url_joins_base_path_and_incoming_path() {
        let t = target_with(
            TargetConfig::new("a", "https://host/openai/"),
            MockTransport::always(200),
        );
        assert_eq!(t.url_for("/v1/models?x=1"), "https://host/openai/v1/models?x=1");
        let t = target_with(TargetConfig::new("b", "https://host"), MockTransport::always(200));
        assert_eq!(t.url_for("/v1/chat/completions"), "https://host/v1/chat/completions");
    }

    #[tokio::test]
    async fn handle_strips_hop_headers_and_adds_bearer() {
        let transport = MockTransport::always(200);
        let mut config = TargetConfig::new("a", "http://a.test/base");
        config.api_key = Some("sk-upstream".into());
        let t = target_with(config, transport.clone());

        let mut req = ProxyRequest::new(Method::GET, "/v1/models");
        req.headers.insert(header::HOST, HeaderValue::from_static("gateway"));
        req.headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        req.headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        req.headers.insert("x-custom", HeaderValue::from_static("kept"));

        let resp = t.handle(req, &env(), &[]).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert!(resp.headers.get(header::CONTENT_LENGTH).is_none());

        let (url, sent) = transport.seen().remove(0);
        assert_eq!(url, "http://a.test/base/v1/models");
        assert!(sent.headers.get(header::HOST).is_none());
        assert!(sent.headers.get("x-forwarded-for").is_none());
        assert!(sent.headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(sent.headers.get("x-custom").unwrap(), "kept");
        assert_eq!(sent.headers.get(header::AUTHORIZATION).unwrap(), "Bearer sk-upstream");
    }

    #[tokio::test]
    async fn model_alias_rewrites_only_when_mapped() {
        let transport = MockTransport::always(200);
        let mut config = TargetConfig::new("a", "http://a.test");
        config.model_aliases.insert("fast".into(), "qwen3:8b".into());
        let t = target_with(config, transport.clone());

        let req = ProxyRequest::new(Method::POST, "/v1/chat/completions")
            .with_json(&json!({"model": "fast", "messages": []}));
        t.handle(req, &env(), &[]).await.unwrap();

        let raw = bytes::Bytes::from_static(br#"{ "model" : "other" }"#);
        let mut req = ProxyRequest::new(Method::POST, "/v1/chat/completions");
        req.body = raw.clone();
        t.handle(req, &env(), &[]).await.unwrap();

        let seen = transport.seen();
        let body: Value = serde_json::from_slice(&seen[0].1.body).unwrap();
        assert_eq!(body["model"], "qwen3:8b");
        assert_eq!(seen[1].1.body, raw);
    }

    #[tokio::test]
    async fn transport_errors_are_classified() {
        let t = target_with(
            TargetConfig::new("a", "http://a.test"),
            MockTransport::script(vec![Reply::Timeout, Reply::Refused]),
        );
        let first = t.handle(ProxyRequest::new(Method::GET, "/"), &env(), &[]).await;
        assert_eq!(first.unwrap_err().status(), StatusCode::GATEWAY_TIMEOUT);
        let second = t.handle(ProxyRequest::new(Method::GET, "/"), &env(), &[]).await;
        assert_eq!(second.unwrap_err().status(), StatusCode::BAD_GATEWAY);
    }

    struct PathTag(&'static str);

    impl Hook for PathTag {
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
            let path = format!("{}/{}", request.path(), tag);
            request.set_path(&path);
            ctx.add_response(move |mut resp| {
                resp.headers.append("x-hook", HeaderValue::from_static(tag));
                resp
            });
            Ok(request)
        }
    }

    #[tokio::test]
    async fn interceptors_run_before_target_hooks() {
        let transport = MockTransport::always(200);
        let t = UpstreamTarget::new(
            TargetConfig::new("a", "http://a.test"),
            vec![Arc::new(PathTag("target"))],
            transport.clone(),
        );
        let interceptors: Vec<Arc<dyn Hook>> = vec![Arc::new(PathTag("global"))];
        let resp = t
            .handle(ProxyRequest::new(Method::GET, "/x"), &env(), &interceptors)
            .await
            .unwrap();
        assert_eq!(transport.seen()[0].0, "http://a.test/x/global/target");
        let order: Vec<_> = resp.headers.get_all("x-hook").iter().collect();
        assert_eq!(order, vec!["target", "global"]);
    }

    struct BrokenBody;

    #[async_trait]
    impl Transport for BrokenBody {
        async fn send(
            &self,
            _url: &str,
            _request: ProxyRequest,
        ) -> Result<ProxyResponse, GatewayError> {
            let chunks = futures_util::stream::iter(vec![
                Ok(bytes::Bytes::from_static(b"data: partial\n\n")),
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out")),
            ])
            .boxed();
            Ok(ProxyResponse::new(StatusCode::OK, HeaderMap::new(), Body::Stream(chunks)))
        }
    }

    #[tokio::test]
    async fn body_read_errors_reach_the_caller() {
        let t = UpstreamTarget::new(
            TargetConfig::new("a", "http://a.test"),
            Vec::new(),
            Arc::new(BrokenBody),
        );
        let resp = t
            .handle(ProxyRequest::new(Method::GET, "/v1/models"), &env(), &[])
            .await
            .unwrap();
        let mut body = resp.body.into_stream();
        assert_eq!(&body.next().await.unwrap().unwrap()[..], b"data: partial\n\n");
        let err = body.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        assert!(body.next().await.is_none());
    }

    #[test]
    fn unusable_proxy_fails_target_construction() {
        let mut config = TargetConfig::new("a", "http://a.test");
        config.https_proxy = Some("http://[not-closed".into());
        let err = UpstreamTarget::from_config(config, &HookRegistry::builtin()).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }
}
