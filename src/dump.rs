//! Request/response dumping.
//!
//! The proxy core only ever calls [`Dumper::dump`]; where the entries go is
//! up to the sink chosen from [`DumpConfig`].

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use futures_util::StreamExt;
use http::HeaderMap;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::{DumpConfig, DumpMode};
use crate::exchange::{Body, ProxyRequest, ProxyResponse};

/// Which side of the gateway a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    User,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

pub trait Dumper: Send + Sync {
    /// `event` is `info`, `body` or `chunk`.
    fn dump(&self, leg: Leg, direction: Direction, event: &str, payload: Value);

    /// Sinks that drop everything report `false` so callers can skip
    /// wrapping bodies.
    fn enabled(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct NoopDumper;

impl Dumper for NoopDumper {
    fn dump(&self, _leg: Leg, _direction: Direction, _event: &str, _payload: Value) {}

    fn enabled(&self) -> bool {
        false
    }
}

/// Emits every entry as a `tracing` event.
#[derive(Debug)]
pub struct TracingDumper {
    request_id: String,
}

impl TracingDumper {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }
}

impl Dumper for TracingDumper {
    fn dump(&self, leg: Leg, direction: Direction, event: &str, payload: Value) {
        tracing::info!(
            request_id = %self.request_id,
            leg = ?leg,
            direction = ?direction,
            event,
            payload = %payload,
            "dump"
        );
    }
}

#[derive(Debug, Serialize)]
struct DumpEntry<'a> {
    timestamp: String,
    request_id: &'a str,
    leg: Leg,
    direction: Direction,
    event: &'a str,
    payload: Value,
}

/// One JSON line per entry, one file per request.
#[derive(Debug)]
pub struct JsonlDumper {
    path: PathBuf,
    request_id: String,
    file: Mutex<Option<File>>,
}

impl JsonlDumper {
    /// File at `<root>/<request path>/<timestamp>.jsonl`; created on first write.
    pub fn new(root: &Path, request_path: &str, request_id: impl Into<String>) -> Self {
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%3f");
        Self {
            path: dump_dir(root, request_path).join(format!("{stamp}.jsonl")),
            request_id: request_id.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("dump file lock poisoned"))?;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *guard = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        match guard.as_mut() {
            Some(file) => writeln!(file, "{line}"),
            None => Ok(()),
        }
    }
}

impl Dumper for JsonlDumper {
    fn dump(&self, leg: Leg, direction: Direction, event: &str, payload: Value) {
        let entry = DumpEntry {
            timestamp: chrono::Local::now()
                .format("%Y-%m-%d %H:%M:%S%.3f")
                .to_string(),
            request_id: &self.request_id,
            leg,
            direction,
            event,
            payload,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to serialize dump entry: {}", e);
                return;
            }
        };
        if let Err(e) = self.append(&line) {
            tracing::warn!("Failed to write dump {}: {}", self.path.display(), e);
        }
    }
}

/// Directory for one request path, with characters unsafe in file names
/// replaced and the query string dropped.
fn dump_dir(root: &Path, request_path: &str) -> PathBuf {
    let path = request_path.split('?').next().unwrap_or_default();
    let cleaned: String = path
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '*' | '?' | '\\' => '_',
            other => other,
        })
        .collect();
    let mut dir = root.to_path_buf();
    let mut pushed = false;
    for segment in cleaned.split('/').filter(|s| !s.is_empty() && *s != "..") {
        dir.push(segment);
        pushed = true;
    }
    if !pushed {
        dir.push("root");
    }
    dir
}

/// Sink for one inbound request according to `config`.
pub fn dumper_for(config: &DumpConfig, request_path: &str, request_id: &str) -> Arc<dyn Dumper> {
    match config.mode {
        DumpMode::Off => Arc::new(NoopDumper),
        DumpMode::Tracing => Arc::new(TracingDumper::new(request_id)),
        DumpMode::Jsonl => Arc::new(JsonlDumper::new(&config.dir(), request_path, request_id)),
    }
}

pub fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(
            name.as_str().to_string(),
            Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }
    Value::Object(map)
}

fn body_payload(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| json!({ "text": String::from_utf8_lossy(bytes) }))
}

/// `info` then `body` for an outgoing request.
pub fn dump_request(dumper: &dyn Dumper, leg: Leg, url: &str, request: &ProxyRequest) {
    if !dumper.enabled() {
        return;
    }
    dumper.dump(
        leg,
        Direction::Request,
        "info",
        json!({
            "url": url,
            "method": request.method.as_str(),
            "headers": headers_to_json(&request.headers),
        }),
    );
    if !request.body.is_empty() {
        dumper.dump(leg, Direction::Request, "body", body_payload(&request.body));
    }
}

/// `info` now, then `chunk` per streamed chunk for event streams or one
/// `body` entry once a non-streaming body has been read.
pub fn dump_response(dumper: Arc<dyn Dumper>, leg: Leg, response: ProxyResponse) -> ProxyResponse {
    if !dumper.enabled() {
        return response;
    }
    dumper.dump(
        leg,
        Direction::Response,
        "info",
        json!({
            "status": response.status.as_u16(),
            "headers": headers_to_json(&response.headers),
        }),
    );

    if response.is_event_stream() {
        return response.map_stream(move |stream| {
            stream
                .inspect(move |chunk| {
                    if let Ok(bytes) = chunk {
                        dumper.dump(
                            leg,
                            Direction::Response,
                            "chunk",
                            json!({ "text": String::from_utf8_lossy(bytes) }),
                        );
                    }
                })
                .boxed()
        });
    }

    if let Body::Full(bytes) = &response.body {
        if !bytes.is_empty() {
            dumper.dump(leg, Direction::Response, "body", body_payload(bytes));
        }
        return response;
    }

    response.map_stream(move |mut stream| {
        async_stream::stream! {
            let mut seen = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                if let Ok(bytes) = &chunk {
                    seen.extend_from_slice(bytes);
                }
                yield chunk;
            }
            if !seen.is_empty() {
                dumper.dump(leg, Direction::Response, "body", body_payload(&seen));
            }
        }
        .boxed()
    })
}
