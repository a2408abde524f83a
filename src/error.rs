use http::StatusCode;

/// Gateway error types
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("No upstream found for {0}")]
    UpstreamNotFound(String),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown hook: {0}")]
    UnknownHook(String),
}

impl GatewayError {
    /// HTTP status surfaced to the caller for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::UpstreamNotFound(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::InvalidConfig(_) | GatewayError::UnknownHook(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the error came from the outbound network call.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTimeout(_) | GatewayError::BadGateway(_)
        )
    }
}
