use std::sync::Arc;
use std::time::Duration;

use actix_web::HttpResponse;
use http::StatusCode;
use tracing_subscriber::{fmt, EnvFilter};

use crate::breaker::CircuitBreaker;
use crate::config::GatewayConfig;
use crate::endpoint::EndpointSet;
use crate::error::GatewayError;
use crate::hooks::HookRegistry;
use crate::registry::UpstreamRegistry;

/// Load an env file, returning where it came from.
///
/// Order: ENV_FILE / ENVFILE / DOTENV_PATH, then `.env` in the working
/// directory, then `.env` in the executable's directory or any parent.
fn load_env_file() -> Option<String> {
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                return Some(format!("{p} ({key})"));
            }
        }
    }

    if dotenvy::dotenv().is_ok() {
        return Some(".env".into());
    }

    let exe = std::env::current_exe().ok()?;
    let mut dir_opt = exe.parent();
    while let Some(dir) = dir_opt {
        let candidate = dir.join(".env");
        if candidate.is_file() && dotenvy::from_filename(&candidate).is_ok() {
            return Some(candidate.display().to_string());
        }
        dir_opt = dir.parent();
    }
    None
}

/// Load the env file (if any) and install the global tracing subscriber,
/// filtered by RUST_LOG.
pub fn init_tracing() {
    let env_source = load_env_file();

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,actix_server=warn".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!(
        "Environment loaded from: {}",
        env_source.as_deref().unwrap_or("none")
    );
}

/// Bind address from BIND_ADDR, default 0.0.0.0:8088.
pub fn env_bind_addr() -> String {
    std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8088".into())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.trim().to_ascii_lowercase())
        .map(|v| v == "1" || v == "true" || v == "yes" || v == "on")
        .unwrap_or(false)
}

/// Build the outbound HTTP client for one upstream target.
///
/// `proxy` (the target's `https_proxy`) wins over the environment. Otherwise:
/// - AIGATE_NO_PROXY = 1|true|yes|on  -> disable all proxies
/// - AIGATE_PROXY_URL = <url>         -> proxy for all schemes
/// - HTTP_PROXY / HTTPS_PROXY         -> scheme-specific proxies
///
/// `timeout_seconds` falls back to AIGATE_HTTP_TIMEOUT_SECONDS; unset means
/// no overall deadline. An unusable target proxy or AIGATE_PROXY_URL is a
/// config error; malformed HTTP(S)_PROXY values are skipped with a warning.
pub fn build_http_client(
    proxy: Option<&str>,
    timeout_seconds: Option<u64>,
) -> Result<reqwest::Client, GatewayError> {
    let mut builder = reqwest::Client::builder();

    let timeout = timeout_seconds.or_else(|| {
        std::env::var("AIGATE_HTTP_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
    });
    if let Some(secs) = timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    match proxy.map(str::trim).filter(|p| !p.is_empty()) {
        Some(url) => {
            let p = reqwest::Proxy::all(url).map_err(|e| {
                GatewayError::InvalidConfig(format!("invalid upstream proxy {url}: {e}"))
            })?;
            builder = builder.proxy(p);
        }
        None if env_flag("AIGATE_NO_PROXY") => builder = builder.no_proxy(),
        None => {
            if let Some(url) = env_value("AIGATE_PROXY_URL") {
                let p = reqwest::Proxy::all(&url).map_err(|e| {
                    GatewayError::InvalidConfig(format!("invalid AIGATE_PROXY_URL {url}: {e}"))
                })?;
                builder = builder.proxy(p);
            }
            if let Some(url) = env_value("HTTP_PROXY").or_else(|| env_value("http_proxy")) {
                match reqwest::Proxy::http(&url) {
                    Ok(p) => builder = builder.proxy(p),
                    Err(e) => tracing::warn!("Ignoring invalid HTTP_PROXY {}: {}", url, e),
                }
            }
            if let Some(url) = env_value("HTTPS_PROXY").or_else(|| env_value("https_proxy")) {
                match reqwest::Proxy::https(&url) {
                    Ok(p) => builder = builder.proxy(p),
                    Err(e) => tracing::warn!("Ignoring invalid HTTPS_PROXY {}: {}", url, e),
                }
            }
        }
    }

    builder = builder.user_agent(format!("aigate/{}", env!("CARGO_PKG_VERSION")));

    builder
        .build()
        .map_err(|e| GatewayError::InvalidConfig(format!("cannot build HTTP client: {e}")))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Shared application state used by the HTTP server and handlers. Built
/// once from the loaded config and never mutated afterwards.
pub struct AppState {
    pub config: GatewayConfig,
    pub registry: Arc<UpstreamRegistry>,
    pub endpoints: EndpointSet,
}

impl AppState {
    /// Resolve hooks, targets and endpoints with the built-in hook set.
    pub fn from_config(config: GatewayConfig) -> Result<Self, GatewayError> {
        Self::with_registries(
            config,
            &HookRegistry::builtin(),
            Arc::new(CircuitBreaker::new()),
        )
    }

    pub fn with_registries(
        config: GatewayConfig,
        hooks: &HookRegistry,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, GatewayError> {
        let registry = Arc::new(UpstreamRegistry::from_config(
            &config.upstreams,
            hooks,
            breaker,
        )?);
        let endpoints = EndpointSet::from_config(&config, hooks, registry.clone())?;
        Ok(Self {
            config,
            registry,
            endpoints,
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.registry.breaker()
    }
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

/// CORS policy from the environment:
/// - CORS_ALLOWED_ORIGINS  (comma list or `*`, default any)
/// - CORS_ALLOWED_METHODS  (comma list or `*`, default any)
/// - CORS_ALLOWED_HEADERS  (comma list or `*`, default any)
/// - CORS_ALLOW_CREDENTIALS (1|true|yes|on)
/// - CORS_MAX_AGE (seconds)
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            for part in origins.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                cors = cors.allowed_origin(part);
            }
        }
        _ => cors = cors.allow_any_origin(),
    }

    match std::env::var("CORS_ALLOWED_METHODS") {
        Ok(methods) if methods.trim() != "*" => {
            let methods: Vec<&str> = methods
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            if !methods.is_empty() {
                cors = cors.allowed_methods(methods);
            }
        }
        _ => cors = cors.allow_any_method(),
    }

    match std::env::var("CORS_ALLOWED_HEADERS") {
        Ok(headers) if headers.trim() != "*" => {
            for h in headers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                cors = cors.allowed_header(h);
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if env_flag("CORS_ALLOW_CREDENTIALS") {
        cors = cors.supports_credentials();
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}
