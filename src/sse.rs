//! Server-Sent-Event framing: incremental parsing and encoding.

use serde_json::Value;

/// Stream terminator used by OpenAI-style event streams.
pub const DONE: &str = "[DONE]";

/// One dispatched SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseMessage {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: None,
            data: data.into(),
        }
    }

    pub fn done() -> Self {
        Self::data(DONE)
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE
    }

    /// Parse `data` as JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.data).ok()
    }

    /// Same framing fields, new payload.
    pub fn with_data(&self, data: impl Into<String>) -> Self {
        Self {
            id: self.id.clone(),
            event: self.event.clone(),
            data: data.into(),
        }
    }

    /// Wire form: `id:`/`event:` lines, one `data:` line per payload line,
    /// blank-line terminator.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 16);
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Byte offset just past the first blank-line event delimiter in `buf`.
pub fn find_event_end(buf: &str) -> Option<usize> {
    let lf = buf.find("\n\n").map(|i| i + 2);
    let crlf = buf.find("\r\n\r\n").map(|i| i + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Parse one event block (without its terminator). Blocks carrying no
/// `data` field (comments, keep-alives) dispatch nothing.
pub fn parse_event(block: &str) -> Option<SseMessage> {
    let mut msg = SseMessage::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for raw in block.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        match field {
            "data" => data_lines.push(value),
            "event" => msg.event = Some(value.to_string()),
            "id" => msg.id = Some(value.to_string()),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    msg.data = data_lines.join("\n");
    Some(msg)
}

/// Parse every complete event in `text`; a trailing unterminated block is
/// parsed as well.
pub fn parse_all(text: &str) -> Vec<SseMessage> {
    let mut parser = SseParser::default();
    let mut out = parser.feed(text);
    out.extend(parser.finish());
    out
}

/// Incremental parser tolerant of arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &str) -> Vec<SseMessage> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(end) = find_event_end(&self.buffer) {
            let block: String = self.buffer.drain(..end).collect();
            if let Some(msg) = parse_event(&block) {
                out.push(msg);
            }
        }
        out
    }

    /// Dispatch whatever is left, even without a terminator.
    pub fn finish(&mut self) -> Vec<SseMessage> {
        let rest = std::mem::take(&mut self.buffer);
        parse_event(&rest).into_iter().collect()
    }

    /// Hand back unparsed raw text.
    pub fn take_remaining(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}
