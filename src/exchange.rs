//! In-memory request/response types passed between the hook pipeline, the
//! load balancer and the upstream transport.
//!
//! Request bodies are always fully buffered (`Bytes`) so a request can be
//! replayed across retry attempts and candidates. Response bodies may be a
//! live stream.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode};

pub type BodyStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Response body: fully buffered or streamed from upstream.
pub enum Body {
    Full(Bytes),
    Stream(BodyStream),
}

impl Body {
    pub fn empty() -> Self {
        Body::Full(Bytes::new())
    }

    /// Turn the body into a stream regardless of representation.
    pub fn into_stream(self) -> BodyStream {
        match self {
            Body::Full(bytes) if bytes.is_empty() => stream::empty().boxed(),
            Body::Full(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            Body::Stream(s) => s,
        }
    }

    /// Drain the body into memory.
    pub async fn collect(self) -> Result<Bytes, std::io::Error> {
        match self {
            Body::Full(bytes) => Ok(bytes),
            Body::Stream(mut s) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = s.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Body::Stream(_) => f.debug_tuple("Stream").field(&"<stream>").finish(),
        }
    }
}

/// A request on its way to an upstream target.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path plus optional query string, e.g. `/v1/models?limit=5`.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_json(mut self, value: &serde_json::Value) -> Self {
        self.set_json_body(value);
        self
    }

    pub fn path(&self) -> &str {
        match self.uri.find('?') {
            Some(idx) => &self.uri[..idx],
            None => &self.uri,
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.find('?').map(|idx| &self.uri[idx + 1..])
    }

    /// Replace the path while keeping the query string.
    pub fn set_path(&mut self, path: &str) {
        self.uri = match self.query() {
            Some(q) => format!("{path}?{q}"),
            None => path.to_string(),
        };
    }

    pub fn is_post_to(&self, suffix: &str) -> bool {
        self.method == Method::POST && self.path().ends_with(suffix)
    }

    pub fn is_json(&self) -> bool {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false)
    }

    /// Parse the body as JSON; `None` when empty or malformed.
    pub fn json_body(&self) -> Option<serde_json::Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    pub fn set_json_body(&mut self, value: &serde_json::Value) {
        self.body = Bytes::from(serde_json::to_vec(value).unwrap_or_default());
        self.headers.remove(header::CONTENT_LENGTH);
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }

    /// The `model` field of a JSON body, if any.
    pub fn model(&self) -> Option<String> {
        self.json_body()
            .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(str::to_string))
    }
}

/// A response travelling back towards the caller.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Body) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self::new(
            status,
            headers,
            Body::Full(Bytes::from(serde_json::to_vec(value).unwrap_or_default())),
        )
    }

    /// JSON error body in the `{"error":{"message":..}}` shape.
    pub fn error(status: StatusCode, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": { "message": message } }))
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn is_event_stream(&self) -> bool {
        let ct = self.content_type();
        ct.contains("text/event-stream") || ct.contains("application/stream")
    }

    pub fn is_json(&self) -> bool {
        self.content_type().contains("application/json")
    }

    /// Rewrap the body as a stream passed through `f`.
    pub fn map_stream(self, f: impl FnOnce(BodyStream) -> BodyStream) -> Self {
        let ProxyResponse {
            status,
            headers,
            body,
        } = self;
        Self::new(status, headers, Body::Stream(f(body.into_stream())))
    }

    /// Rewrite the complete body. A streamed body is collected lazily, once
    /// the consumer starts reading it.
    pub fn map_full_body<F>(self, f: F) -> Self
    where
        F: FnOnce(Bytes) -> Bytes + Send + 'static,
    {
        let ProxyResponse {
            status,
            headers,
            body,
        } = self;
        let body = match body {
            Body::Full(bytes) => Body::Full(f(bytes)),
            Body::Stream(inner) => Body::Stream(
                async_stream::stream! {
                    match Body::Stream(inner).collect().await {
                        Ok(bytes) => yield Ok(f(bytes)),
                        Err(err) => yield Err(err),
                    }
                }
                .boxed(),
            ),
        };
        Self::new(status, headers, body)
    }
}
