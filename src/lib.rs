#![forbid(unsafe_code)]
#![doc = r#"
Aigate

Gateway for chat-completion traffic. Callers speak OpenAI, Claude or Ollama
style; upstream providers may speak something else. Aigate picks a healthy
upstream, forwards the request with per-target retries and circuit breaking,
and rewrites bodies (including live event streams) on the way through.

Crate highlights
- `registry` + `balancer`: (protocol, model) matching, priority tiers with
  shuffled ties, retry policy, breaker-aware failover.
- `hooks`: request rewrites with deferred, reverse-ordered response handlers.
- `stream`: chunk-boundary-safe stream patches built on one keyword
  interception engine.
- `protocol`: Claude <-> OpenAI conversion and Ollama compatibility.
- `server`: actix-web adapter (binary in `main.rs`).

Modules
- `config`: gateway file schema (JSON/YAML) and validation.
- `endpoint`: inbound surfaces mounted under prefixes.
- `upstream`: one target and its outbound transport.
- `dump`: request/response dump sinks.
- `util`: tracing, HTTP client, CORS, shared `AppState`.
"#]

pub mod balancer;
pub mod breaker;
pub mod config;
pub mod context;
pub mod dump;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod hooks;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod sse;
pub mod stream;
pub mod upstream;
pub mod util;

pub use crate::balancer::LoadBalancer;
pub use crate::breaker::{CircuitBreaker, Clock, ManualClock, SystemClock};
pub use crate::config::{
    BreakerPolicy, DumpConfig, DumpMode, EndpointConfig, GatewayConfig, HookSpec, RetryPolicy,
    RetryStatus, TargetConfig,
};
pub use crate::context::RequestEnv;
pub use crate::endpoint::{Endpoint, EndpointSet};
pub use crate::error::GatewayError;
pub use crate::exchange::{Body, ProxyRequest, ProxyResponse};
pub use crate::hooks::{Hook, HookContext, HookRegistry, HookRunner};
pub use crate::protocol::Protocol;
pub use crate::registry::{glob_match, UpstreamRegistry};
pub use crate::upstream::{ReqwestTransport, Transport, UpstreamTarget};
