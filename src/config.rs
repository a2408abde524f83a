//! Gateway Configuration Module
//!
//! One JSON or YAML document describes the whole gateway:
//! - upstream targets (protocols, model globs, aliases, priority, retry and
//!   breaker policy, per-target hooks)
//! - endpoint surfaces (protocol, mount prefix, endpoint hooks)
//! - global interceptors applied on every endpoint
//! - request/response dumping and local authentication
//!
//! The document is loaded once at startup and never mutated afterwards.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::GatewayError;
use crate::protocol::Protocol;

/// A retryable response status: an exact code or a class such as `"5xx"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RetryStatus {
    Code(u16),
    Class(String),
}

impl RetryStatus {
    pub fn matches(&self, status: u16) -> bool {
        match self {
            RetryStatus::Code(code) => *code == status,
            RetryStatus::Class(class) => {
                let class = class.to_ascii_lowercase();
                match class.strip_suffix("xx").and_then(|d| d.parse::<u16>().ok()) {
                    Some(hundreds) if class.len() == 3 => status / 100 == hundreds,
                    _ => class.parse::<u16>().map(|c| c == status).unwrap_or(false),
                }
            }
        }
    }
}

/// Per-target retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Tries per candidate before moving on (default: 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Sleep between tries on the same candidate (default: 0)
    #[serde(default)]
    pub backoff_ms: u64,

    /// Statuses that count as failures (default: 5xx, 429, 408, 409)
    #[serde(default = "default_retry_on_status")]
    pub retry_on_status: Vec<RetryStatus>,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_on_status() -> Vec<RetryStatus> {
    vec![
        RetryStatus::Class("5xx".to_string()),
        RetryStatus::Code(429),
        RetryStatus::Code(408),
        RetryStatus::Code(409),
    ]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
            retry_on_status: default_retry_on_status(),
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, status: u16) -> bool {
        self.retry_on_status.iter().any(|s| s.matches(status))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerPolicy {
    /// How long a failed target stays excluded; `<= 0` disables breaking.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: i64,
}

fn default_cooldown_ms() -> i64 {
    30_000
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Hook reference: a bare name, or a name with hook-specific config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum HookSpec {
    Name(String),
    Configured {
        name: String,
        #[serde(default)]
        config: serde_json::Value,
    },
}

impl HookSpec {
    pub fn name(&self) -> &str {
        match self {
            HookSpec::Name(name) => name,
            HookSpec::Configured { name, .. } => name,
        }
    }

    pub fn config(&self) -> serde_json::Value {
        match self {
            HookSpec::Name(_) => serde_json::Value::Null,
            HookSpec::Configured { config, .. } => config.clone(),
        }
    }
}

impl From<&str> for HookSpec {
    fn from(name: &str) -> Self {
        HookSpec::Name(name.to_string())
    }
}

/// One upstream provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique name; also the circuit-breaker key
    pub name: String,

    /// Base URL, e.g. "https://api.openai.com" or "https://host/openai/"
    pub api_base: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the API key, used when `api_key` is unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_env: Option<String>,

    /// Outbound proxy for this target only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,

    /// Protocols this target serves; empty matches any
    #[serde(default)]
    pub protocols: Vec<Protocol>,

    /// Model glob patterns; empty matches any model
    #[serde(default)]
    pub models: Vec<String>,

    /// Client model name -> upstream model name
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,

    /// Lower is preferred (default: 1000)
    #[serde(default = "default_priority")]
    pub priority: i64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub breaker: BreakerPolicy,

    #[serde(default, alias = "plugins")]
    pub hooks: Vec<HookSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

fn default_priority() -> i64 {
    1000
}

impl TargetConfig {
    pub fn new(name: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_base: api_base.into(),
            api_key: None,
            key_env: None,
            https_proxy: None,
            protocols: Vec::new(),
            models: Vec::new(),
            model_aliases: HashMap::new(),
            priority: default_priority(),
            retry: RetryPolicy::default(),
            breaker: BreakerPolicy::default(),
            hooks: Vec::new(),
            timeout_seconds: None,
        }
    }

    /// Explicit key first, then the configured environment variable.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| {
                self.key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|k| !k.is_empty())
            })
    }
}

/// An inbound surface mounted under `prefix`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(rename = "type")]
    pub protocol: Protocol,

    /// Mount prefix stripped before forwarding; empty mounts at the root
    #[serde(default)]
    pub prefix: String,

    #[serde(default, alias = "plugins")]
    pub hooks: Vec<HookSpec>,
}

impl EndpointConfig {
    pub fn new(protocol: Protocol, prefix: impl Into<String>) -> Self {
        Self {
            protocol,
            prefix: prefix.into(),
            hooks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DumpMode {
    #[default]
    Off,
    Tracing,
    Jsonl,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DumpConfig {
    #[serde(default)]
    pub mode: DumpMode,

    /// Root directory for JSONL dumps (default: "dumps")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl DumpConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| PathBuf::from("dumps"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// Listen address, overridden by `--bind`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    /// When set, callers must present this token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_auth_token: Option<String>,

    #[serde(default)]
    pub dump: DumpConfig,

    /// Hooks prepended to every endpoint's hook list
    #[serde(default)]
    pub interceptors: Vec<HookSpec>,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    #[serde(default)]
    pub upstreams: Vec<TargetConfig>,
}

impl GatewayConfig {
    /// Load from a `.json`, `.yaml` or `.yml` file and validate.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let config = if is_yaml {
            Self::from_yaml_str(&content)?
        } else {
            Self::from_json_str(&content)?
        };
        tracing::info!(
            "Loaded gateway config from {}: {} upstreams, {} endpoints",
            path.display(),
            config.upstreams.len(),
            config.endpoints.len()
        );
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let mut config: GatewayConfig =
            serde_json::from_str(content).context("parsing JSON gateway config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut config: GatewayConfig =
            serde_yaml::from_str(content).context("parsing YAML gateway config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent configs and normalize the rest in place.
    pub fn validate(&mut self) -> Result<(), GatewayError> {
        let mut names = HashSet::new();
        for target in &mut self.upstreams {
            if target.name.trim().is_empty() {
                return Err(GatewayError::InvalidConfig(
                    "upstream with empty name".to_string(),
                ));
            }
            if !names.insert(target.name.clone()) {
                return Err(GatewayError::InvalidConfig(format!(
                    "duplicate upstream name '{}'",
                    target.name
                )));
            }
            if target.api_base.trim().is_empty() {
                return Err(GatewayError::InvalidConfig(format!(
                    "upstream '{}' has empty api_base",
                    target.name
                )));
            }
            target.retry.max_attempts = target.retry.max_attempts.max(1);
        }

        if self.endpoints.is_empty() {
            self.endpoints.push(EndpointConfig::new(Protocol::Openai, ""));
        }
        for endpoint in &mut self.endpoints {
            endpoint.prefix = normalize_prefix(&endpoint.prefix);
        }
        Ok(())
    }
}

/// `""` or `/segment[/segment]` without a trailing slash.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_status_classes_and_codes() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(500));
        assert!(policy.should_retry(503));
        assert!(policy.should_retry(429));
        assert!(policy.should_retry(408));
        assert!(policy.should_retry(409));
        assert!(!policy.should_retry(404));
        assert!(!policy.should_retry(200));
        assert!(RetryStatus::Class("4xx".into()).matches(418));
        assert!(RetryStatus::Class("502".into()).matches(502));
    }

    #[test]
    fn json_config_applies_defaults() {
        let config = GatewayConfig::from_json_str(
            r#"{
                "upstreams": [
                    {"name": "primary", "api_base": "https://api.example.com/v1",
                     "protocols": ["openai"], "models": ["gpt-*"],
                     "retry": {"max_attempts": 0, "retry_on_status": ["5xx", 429]},
                     "hooks": ["cursor-compatible", {"name": "reasoning-to-think", "config": ["qwen*"]}]}
                ]
            }"#,
        )
        .unwrap();
        let target = &config.upstreams[0];
        assert_eq!(target.priority, 1000);
        assert_eq!(target.retry.max_attempts, 1);
        assert_eq!(target.breaker.cooldown_ms, 30_000);
        assert_eq!(target.hooks[0].name(), "cursor-compatible");
        assert_eq!(target.hooks[1].config(), serde_json::json!(["qwen*"]));
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].protocol, Protocol::Openai);
    }

    #[test]
    fn yaml_config_parses_endpoints() {
        let config = GatewayConfig::from_yaml_str(
            r#"
local_auth_token: secret
dump:
  mode: jsonl
  dir: /tmp/aigate
interceptors: [cursor-compatible]
endpoints:
  - type: ollama
    prefix: ollama/
  - type: claude
    prefix: /claude
    plugins: [simulate-claude-code-client]
upstreams:
  - name: local
    api_base: http://127.0.0.1:11434
    priority: 10
    model_aliases:
      fast: qwen3:8b
"#,
        )
        .unwrap();
        assert_eq!(config.dump.mode, DumpMode::Jsonl);
        assert_eq!(config.endpoints[0].prefix, "/ollama");
        assert_eq!(config.endpoints[1].hooks[0].name(), "simulate-claude-code-client");
        assert_eq!(config.upstreams[0].model_aliases["fast"], "qwen3:8b");
        assert_eq!(config.interceptors.len(), 1);
    }

    #[test]
    fn rejects_duplicate_names_and_empty_base() {
        let dup = r#"{"upstreams": [
            {"name": "a", "api_base": "http://x"},
            {"name": "a", "api_base": "http://y"}
        ]}"#;
        assert!(GatewayConfig::from_json_str(dup).is_err());

        let empty = r#"{"upstreams": [{"name": "a", "api_base": " "}]}"#;
        assert!(GatewayConfig::from_json_str(empty).is_err());

        let bad_type = r#"{"endpoints": [{"type": "grpc"}]}"#;
        assert!(GatewayConfig::from_json_str(bad_type).is_err());
    }

    #[test]
    fn load_from_file_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yml");
        std::fs::write(&path, "upstreams:\n  - name: a\n    api_base: http://x\n").unwrap();
        let config = GatewayConfig::load_from_file(&path).unwrap();
        assert_eq!(config.upstreams[0].name, "a");
    }

    #[test]
    fn normalize_prefix_shapes() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("openai/"), "/openai");
        assert_eq!(normalize_prefix("/a/b"), "/a/b");
    }
}
