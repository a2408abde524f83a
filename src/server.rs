//! actix-web adapter: every path except `/health` and `/status` goes to the
//! endpoint whose prefix matches, after the optional local-token check.

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};

use crate::context::{new_request_id, RequestEnv};
use crate::dump::{dump_request, dump_response, dumper_for, Leg};
use crate::exchange::{Body, ProxyRequest, ProxyResponse};
use crate::util::{error_response, AppState};

/// Request bodies up to this size are accepted (chat histories get large).
const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

fn max_body_bytes() -> usize {
    std::env::var("AIGATE_MAX_BODY_BYTES")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_MAX_BODY_BYTES)
}

/// Configure Actix-web routes with AppState.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(max_body_bytes()))
        .route("/health", web::get().to(health))
        .route("/status", web::get().to(status))
        .default_service(web::to(proxy));
}

async fn health() -> impl Responder {
    web::Json(serde_json::json!({ "status": "ok" }))
}

/// Mounted endpoints and the circuit state of every upstream.
async fn status(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(resp) = check_local_auth(&state, &req) {
        return resp;
    }
    let upstreams: Vec<_> = state
        .registry
        .targets()
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name(),
                "priority": t.priority(),
                "protocols": t.config.protocols,
                "circuit_open": state.breaker().is_open(t.name()),
            })
        })
        .collect();
    let endpoints: Vec<_> = state
        .config
        .endpoints
        .iter()
        .map(|e| serde_json::json!({ "type": e.protocol, "prefix": e.prefix }))
        .collect();
    HttpResponse::Ok().json(serde_json::json!({
        "name": "aigate",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": endpoints,
        "upstreams": upstreams,
    }))
}

fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
}

fn api_key_header(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

/// `Err` carries the 401 to send back.
fn check_local_auth(state: &AppState, req: &HttpRequest) -> Result<(), HttpResponse> {
    let Some(token) = state.config.local_auth_token.as_deref() else {
        return Ok(());
    };
    if bearer_token(req) == Some(token) || api_key_header(req) == Some(token) {
        return Ok(());
    }
    Err(error_response(
        StatusCode::UNAUTHORIZED,
        "missing or invalid local auth token",
    ))
}

/// Rebuild the inbound actix request as a [`ProxyRequest`]. Local auth
/// credentials are dropped so they never reach an upstream.
fn to_proxy_request(state: &AppState, req: &HttpRequest, body: Bytes) -> Option<ProxyRequest> {
    let method = Method::from_bytes(req.method().as_str().as_bytes()).ok()?;
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.path().to_string());

    let mut headers = HeaderMap::new();
    for (name, value) in req.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    if let Some(token) = state.config.local_auth_token.as_deref() {
        if bearer_token(req) == Some(token) {
            headers.remove(http::header::AUTHORIZATION);
        }
        if api_key_header(req) == Some(token) {
            headers.remove("x-api-key");
        }
    }

    Some(ProxyRequest {
        method,
        uri,
        headers,
        body,
    })
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "transfer-encoding" | "content-length" | "upgrade"
    )
}

fn into_http_response(response: ProxyResponse) -> HttpResponse {
    let status = actix_web::http::StatusCode::from_u16(response.status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    for (name, value) in response.headers.iter() {
        if !is_hop_by_hop(name) {
            builder.append_header((name.as_str(), value.as_bytes()));
        }
    }
    let streaming = response.is_event_stream();
    match response.body {
        Body::Full(bytes) => builder.body(bytes),
        Body::Stream(stream) => {
            if streaming && !response.headers.contains_key(http::header::CACHE_CONTROL) {
                builder.insert_header(("cache-control", "no-cache"));
            }
            builder.streaming(stream)
        }
    }
}

async fn proxy(state: web::Data<AppState>, req: HttpRequest, body: web::Bytes) -> HttpResponse {
    if let Err(resp) = check_local_auth(&state, &req) {
        return resp;
    }
    let Some(endpoint) = state.endpoints.route(req.path()) else {
        return error_response(
            StatusCode::NOT_FOUND,
            &format!("no endpoint mounted for {}", req.path()),
        );
    };
    let Some(mut request) = to_proxy_request(&state, &req, body) else {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "unsupported method");
    };

    let request_id = new_request_id();
    let dumper = dumper_for(&state.config.dump, req.path(), &request_id);
    let env = RequestEnv::with_id(request_id, state.breaker().clone(), dumper);
    tracing::info!(
        request_id = %env.request_id,
        "{} {} -> {} endpoint",
        request.method,
        request.uri,
        endpoint.protocol()
    );

    dump_request(env.dumper.as_ref(), Leg::User, &request.uri, &request);
    endpoint.strip_prefix(&mut request);
    let response = endpoint.handle(request, &env).await;
    let response = dump_response(env.dumper.clone(), Leg::User, response);
    into_http_response(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::config::GatewayConfig;
    use crate::endpoint::{Endpoint, EndpointSet};
    use crate::protocol::Protocol;
    use crate::registry::UpstreamRegistry;
    use crate::upstream::mock::MockTransport;
    use crate::upstream::UpstreamTarget;
    use crate::config::TargetConfig;
    use actix_web::{test, App};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn state(token: Option<&str>, transport: Arc<MockTransport>) -> web::Data<AppState> {
        let mut config = GatewayConfig::from_json_str(
            r#"{"endpoints": [{"type": "openai", "prefix": "/openai"}]}"#,
        )
        .unwrap();
        config.local_auth_token = token.map(str::to_string);
        let mut target = TargetConfig::new("mock", "http://mock.test/base");
        target.api_key = Some("sk-upstream".into());
        let registry = Arc::new(UpstreamRegistry::new(
            vec![Arc::new(UpstreamTarget::new(target, Vec::new(), transport))],
            Arc::new(CircuitBreaker::new()),
        ));
        let endpoints = EndpointSet::new(vec![Endpoint::new(
            Protocol::Openai,
            "/openai",
            Vec::new(),
            registry.clone(),
        )]);
        web::Data::new(AppState {
            config,
            registry,
            endpoints,
        })
    }

    #[actix_web::test]
    async fn health_is_open_even_with_auth() {
        let app = test::init_service(
            App::new()
                .app_data(state(Some("local"), MockTransport::always(200)))
                .configure(config_routes),
        )
        .await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn local_auth_rejects_missing_token_and_strips_valid_one() {
        let transport = MockTransport::always(200);
        let app = test::init_service(
            App::new()
                .app_data(state(Some("local"), transport.clone()))
                .configure(config_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/openai/v1/chat/completions")
            .set_json(json!({"model": "m", "messages": []}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 401);
        assert_eq!(transport.calls(), 0);

        let req = test::TestRequest::post()
            .uri("/openai/v1/chat/completions?trace=1")
            .insert_header(("x-api-key", "local"))
            .set_json(json!({"model": "m", "messages": []}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["url"], "http://mock.test/base/v1/chat/completions?trace=1");

        let (_, sent) = transport.seen().remove(0);
        assert!(sent.headers.get("x-api-key").is_none());
        assert_eq!(sent.headers.get("authorization").unwrap(), "Bearer sk-upstream");
    }

    #[actix_web::test]
    async fn unmounted_path_is_404() {
        let app = test::init_service(
            App::new()
                .app_data(state(None, MockTransport::always(200)))
                .configure(config_routes),
        )
        .await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/claude/v1/messages").to_request()).await;
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[actix_web::test]
    async fn status_lists_upstreams() {
        let app = test::init_service(
            App::new()
                .app_data(state(None, MockTransport::always(200)))
                .configure(config_routes),
        )
        .await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/status").to_request()).await;
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["upstreams"][0]["name"], "mock");
        assert_eq!(body["upstreams"][0]["circuit_open"], false);
        assert_eq!(body["endpoints"][0]["prefix"], "/openai");
    }
}
