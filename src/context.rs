use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::dump::Dumper;

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Per-request state shared by every hook invocation and the outbound call.
/// Built when a request arrives and dropped once its response completes.
#[derive(Clone)]
pub struct RequestEnv {
    pub request_id: String,
    pub dumper: Arc<dyn Dumper>,
    pub breaker: Arc<CircuitBreaker>,
}

impl RequestEnv {
    pub fn with_id(
        request_id: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        dumper: Arc<dyn Dumper>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            dumper,
            breaker,
        }
    }

    /// No dumping, fresh request id.
    #[cfg(test)]
    pub(crate) fn with_breaker(breaker: Arc<CircuitBreaker>) -> Self {
        Self::with_id(new_request_id(), breaker, Arc::new(crate::dump::NoopDumper))
    }
}

impl std::fmt::Debug for RequestEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEnv")
            .field("request_id", &self.request_id)
            .finish()
    }
}
