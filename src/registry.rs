//! Upstream Registry Module
//!
//! Matches configured targets against a (protocol, model) pair and filters
//! them by circuit-breaker health.

use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::config::TargetConfig;
use crate::error::GatewayError;
use crate::hooks::HookRegistry;
use crate::protocol::Protocol;
use crate::upstream::UpstreamTarget;

pub struct UpstreamRegistry {
    targets: Vec<Arc<UpstreamTarget>>,
    breaker: Arc<CircuitBreaker>,
}

impl UpstreamRegistry {
    pub fn new(targets: Vec<Arc<UpstreamTarget>>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { targets, breaker }
    }

    /// Build every target from config, resolving hooks once.
    pub fn from_config(
        configs: &[TargetConfig],
        hooks: &HookRegistry,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, GatewayError> {
        let targets = configs
            .iter()
            .cloned()
            .map(|config| UpstreamTarget::from_config(config, hooks).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(targets, breaker))
    }

    pub fn targets(&self) -> &[Arc<UpstreamTarget>] {
        &self.targets
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn matches_protocol(target: &UpstreamTarget, protocol: Option<Protocol>) -> bool {
        match protocol {
            None => true,
            Some(p) => target.config.protocols.is_empty() || target.config.protocols.contains(&p),
        }
    }

    fn matches_model(target: &UpstreamTarget, model: Option<&str>) -> bool {
        match model.filter(|m| !m.is_empty()) {
            None => true,
            Some(m) => {
                target.config.models.is_empty()
                    || target.config.models.iter().any(|p| glob_match(p, m))
            }
        }
    }

    /// Matching targets in config order, healthy ones only. When every match
    /// has an open circuit, the one that reopens soonest is returned alone.
    pub fn find_all(
        &self,
        protocol: Option<Protocol>,
        model: Option<&str>,
    ) -> Vec<Arc<UpstreamTarget>> {
        let matches: Vec<&Arc<UpstreamTarget>> = self
            .targets
            .iter()
            .filter(|t| Self::matches_protocol(t, protocol) && Self::matches_model(t, model))
            .collect();

        let healthy: Vec<Arc<UpstreamTarget>> = matches
            .iter()
            .filter(|t| !self.breaker.is_open(t.name()))
            .map(|t| Arc::clone(*t))
            .collect();

        let list = if healthy.is_empty() {
            matches
                .into_iter()
                .min_by_key(|t| self.breaker.open_until(t.name()).unwrap_or(0))
                .cloned()
                .into_iter()
                .collect()
        } else {
            healthy
        };

        tracing::debug!(
            "Matched {} upstream(s) for protocol={:?} model={:?}",
            list.len(),
            protocol,
            model
        );
        list
    }

    pub fn find(
        &self,
        protocol: Option<Protocol>,
        model: Option<&str>,
    ) -> Result<Arc<UpstreamTarget>, GatewayError> {
        self.find_all(protocol, model)
            .into_iter()
            .next()
            .ok_or_else(|| {
                GatewayError::UpstreamNotFound(format!(
                    "protocol={} model={}",
                    protocol.map(|p| p.as_str()).unwrap_or("any"),
                    model.unwrap_or("any")
                ))
            })
    }
}

/// Simple glob pattern matching (supports * wildcard, case-sensitive)
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('*').collect();

    if pattern_parts.len() == 1 {
        // No wildcards - exact match
        return pattern == text;
    }

    let last = pattern_parts.len() - 1;
    let mut text_pos = 0;

    for (i, part) in pattern_parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }

        if i == 0 {
            if !text.starts_with(part) {
                return false;
            }
            text_pos = part.len();
        } else if i == last {
            // Must end the text without overlapping what was consumed
            if !text.ends_with(part) || text.len() - part.len() < text_pos {
                return false;
            }
            text_pos = text.len();
        } else {
            match text[text_pos..].find(part) {
                Some(pos) => text_pos += pos + part.len(),
                None => return false,
            }
        }
    }

    true
}
