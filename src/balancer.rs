//! Priority-tiered load balancing with per-target retries.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::context::RequestEnv;
use crate::error::GatewayError;
use crate::exchange::{ProxyRequest, ProxyResponse};
use crate::hooks::Hook;
use crate::upstream::UpstreamTarget;

/// Forwards one request across an ordered candidate list. `interceptors`
/// run ahead of each target's own hooks on every attempt.
#[derive(Clone, Default)]
pub struct LoadBalancer {
    interceptors: Vec<Arc<dyn Hook>>,
}

impl LoadBalancer {
    pub fn new(interceptors: Vec<Arc<dyn Hook>>) -> Self {
        Self { interceptors }
    }

    pub fn interceptors(&self) -> &[Arc<dyn Hook>] {
        &self.interceptors
    }

    /// Ascending priority; each equal-priority band is shuffled uniformly.
    pub fn order_candidates<R: Rng + ?Sized>(
        mut candidates: Vec<Arc<UpstreamTarget>>,
        rng: &mut R,
    ) -> Vec<Arc<UpstreamTarget>> {
        candidates.sort_by_key(|t| t.priority());
        let mut start = 0;
        while start < candidates.len() {
            let priority = candidates[start].priority();
            let end = candidates[start..]
                .iter()
                .position(|t| t.priority() != priority)
                .map(|offset| start + offset)
                .unwrap_or(candidates.len());
            candidates[start..end].shuffle(rng);
            start = end;
        }
        candidates
    }

    /// Try candidates in priority order, each up to its `max_attempts`.
    ///
    /// Returns the first response whose status is not retryable; errors other
    /// than transport failures are returned at once as well. When every
    /// candidate is exhausted the last retryable response is returned if
    /// there was one, else the last transport error, else
    /// [`GatewayError::UpstreamNotFound`].
    pub async fn forward(
        &self,
        candidates: Vec<Arc<UpstreamTarget>>,
        request: ProxyRequest,
        env: &RequestEnv,
    ) -> Result<ProxyResponse, GatewayError> {
        let ordered = Self::order_candidates(candidates, &mut rand::thread_rng());
        self.forward_ordered(ordered, request, env).await
    }

    pub async fn forward_ordered(
        &self,
        ordered: Vec<Arc<UpstreamTarget>>,
        request: ProxyRequest,
        env: &RequestEnv,
    ) -> Result<ProxyResponse, GatewayError> {
        let mut last_response: Option<ProxyResponse> = None;
        let mut last_error: Option<GatewayError> = None;

        for target in ordered {
            let policy = &target.config.retry;
            let attempts = policy.max_attempts.max(1);

            for attempt in 1..=attempts {
                match target
                    .handle(request.clone(), env, &self.interceptors)
                    .await
                {
                    Ok(response) if policy.should_retry(response.status.as_u16()) => {
                        tracing::warn!(
                            request_id = %env.request_id,
                            "[{}] attempt {}/{} returned {}",
                            target.name(),
                            attempt,
                            attempts,
                            response.status
                        );
                        last_response = Some(response);
                    }
                    Ok(response) => {
                        env.breaker.mark_success(target.name());
                        return Ok(response);
                    }
                    Err(e) if !e.is_transport() => {
                        tracing::error!(
                            request_id = %env.request_id,
                            "[{}] request rejected before reaching upstream: {}",
                            target.name(),
                            e
                        );
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(
                            request_id = %env.request_id,
                            "[{}] attempt {}/{} failed: {}",
                            target.name(),
                            attempt,
                            attempts,
                            e
                        );
                        last_error = Some(e);
                    }
                }

                if attempt < attempts && policy.backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(policy.backoff_ms)).await;
                }
            }

            env.breaker
                .mark_failure(target.name(), target.config.breaker.cooldown_ms);
        }

        if let Some(response) = last_response {
            return Ok(response);
        }
        Err(last_error.unwrap_or_else(|| {
            GatewayError::UpstreamNotFound("all upstream candidates exhausted".into())
        }))
    }
}
