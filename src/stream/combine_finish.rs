//! Normalizes the end of an OpenAI-style stream into exactly one finish
//! event followed by `[DONE]`.
//!
//! Some upstreams repeat the finish chunk, or send the finish reason and the
//! usage accounting in separate events, and a few never send `[DONE]` at all.
//! On the first non-null `finish_reason` this patch captures the rest of that
//! event and looks ahead over the following ones: events that still carry
//! choices lose their `finish_reason` (and are dropped when nothing else is
//! left in their delta), the first event without choices is kept as the
//! boundary, and then the stream is closed with a synthesized `[DONE]`.
//! Run it after [`super::FinishReasonCleaner`].

use serde_json::Value;

use super::finish_reason::{null_literal, NullLiteral, FINISH_REASON_KEYWORD};
use super::keyword::{InterceptStrategy, KeywordInterceptor, Verdict};
use crate::sse::{find_event_end, parse_event, SseMessage};

#[derive(Debug, Default)]
pub struct CombineFinishChunk;

pub fn combine_finish_chunk() -> KeywordInterceptor<CombineFinishChunk> {
    KeywordInterceptor::new(CombineFinishChunk)
}

impl InterceptStrategy for CombineFinishChunk {
    fn keyword(&self) -> &'static str {
        FINISH_REASON_KEYWORD
    }

    fn classify(&mut self, post: &str, at_end: bool) -> Verdict {
        match null_literal(post, at_end) {
            NullLiteral::Yes(_) => return Verdict::NotMatched,
            NullLiteral::Undecided => return Verdict::Pending,
            NullLiteral::No => {}
        }

        let Some(end) = find_event_end(post) else {
            if !at_end {
                return Verdict::Pending;
            }
            return Verdict::Terminal {
                replacement: format!("{FINISH_REASON_KEYWORD}{}{}", close_event(post), done()),
            };
        };

        let (finish_tail, rest) = post.split_at(end);
        match scan_followers(rest, at_end) {
            Some(followers) => Verdict::Terminal {
                replacement: format!("{FINISH_REASON_KEYWORD}{finish_tail}{followers}{}", done()),
            },
            None => Verdict::Pending,
        }
    }
}

fn done() -> String {
    SseMessage::done().encode()
}

fn close_event(text: &str) -> String {
    if text.ends_with("\n\n") {
        text.to_string()
    } else if text.ends_with('\n') {
        format!("{text}\n")
    } else {
        format!("{text}\n\n")
    }
}

enum Follower {
    Boundary,
    Keep(SseMessage),
    Drop,
}

/// Re-encoded events up to and including the boundary, or `None` while the
/// boundary has not arrived yet.
fn scan_followers(rest: &str, at_end: bool) -> Option<String> {
    let mut emitted = String::new();
    let mut remaining = rest;

    loop {
        let (block, next) = match find_event_end(remaining) {
            Some(end) => remaining.split_at(end),
            None if at_end && remaining.trim().is_empty() => return Some(emitted),
            None if at_end => (remaining, ""),
            None => return None,
        };
        remaining = next;

        let Some(event) = parse_event(block) else {
            continue;
        };
        if event.is_done() {
            return Some(emitted);
        }
        match classify_follower(&event) {
            Follower::Boundary => {
                emitted.push_str(&event.encode());
                return Some(emitted);
            }
            Follower::Keep(msg) => emitted.push_str(&msg.encode()),
            Follower::Drop => {}
        }
    }
}

fn classify_follower(event: &SseMessage) -> Follower {
    let Some(mut json) = event.json() else {
        return Follower::Boundary;
    };
    let Some(choices) = json.get_mut("choices").and_then(Value::as_array_mut) else {
        return Follower::Boundary;
    };
    if choices.is_empty() {
        return Follower::Boundary;
    }

    let mut has_content = false;
    for choice in choices.iter_mut() {
        if let Some(obj) = choice.as_object_mut() {
            obj.remove("finish_reason");
            if obj.get("delta").is_some_and(|d| !is_empty_delta(d)) {
                has_content = true;
            }
        }
    }

    if has_content {
        Follower::Keep(event.with_data(json.to_string()))
    } else {
        Follower::Drop
    }
}

fn is_empty_delta(delta: &Value) -> bool {
    match delta {
        Value::Null => true,
        Value::Object(map) => map
            .values()
            .all(|v| v.is_null() || v.as_str() == Some("")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::parse_all;
    use crate::stream::{apply_chunks, finish_reason_cleaner};

    const TOOL_STREAM: &str = concat!(
        "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"ls\",\"arguments\":\"\"}}]},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{}\"}}]},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        "data: {\"id\":\"c1\",\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":3}}\n\n",
        "data: [DONE]\n\n",
        "data: {\"id\":\"late\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"x\"}}]}\n\n",
    );

    fn finish_count(out: &str) -> usize {
        parse_all(out)
            .iter()
            .filter_map(SseMessage::json)
            .filter(|v| {
                v["choices"]
                    .as_array()
                    .map(|cs| cs.iter().any(|c| c["finish_reason"].is_string()))
                    .unwrap_or(false)
            })
            .count()
    }

    fn run_chunked(input: &str, size: usize) -> String {
        let cleaned = apply_chunks(&mut finish_reason_cleaner(), &[input]);
        let bytes: Vec<char> = cleaned.chars().collect();
        let pieces: Vec<String> = bytes.chunks(size).map(|c| c.iter().collect()).collect();
        let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
        apply_chunks(&mut combine_finish_chunk(), &refs)
    }

    #[test]
    fn tool_call_stream_ends_with_single_finish_then_done() {
        for size in [1, 7, 64, TOOL_STREAM.len()] {
            let out = run_chunked(TOOL_STREAM, size);
            let events = parse_all(&out);
            assert_eq!(finish_count(&out), 1, "chunk size {size}");
            assert!(events.last().unwrap().is_done());
            assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);
            assert!(out.contains("\"usage\""));
            assert!(!out.contains("late"));
        }
    }

    #[test]
    fn output_is_independent_of_chunk_size() {
        let whole = run_chunked(TOOL_STREAM, TOOL_STREAM.len());
        for size in 1..40 {
            assert_eq!(run_chunked(TOOL_STREAM, size), whole, "chunk size {size}");
        }
    }

    #[test]
    fn null_finish_reason_is_left_alone() {
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"},\"finish_reason\":null}]}\n\n";
        assert_eq!(apply_chunks(&mut combine_finish_chunk(), &[input]), input);
    }

    #[test]
    fn follower_with_content_is_kept_without_finish_reason() {
        let input = concat!(
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"tail\"},\"finish_reason\":\"stop\"}]}\n\n",
        );
        let out = apply_chunks(&mut combine_finish_chunk(), &[input]);
        let events = parse_all(&out);
        assert_eq!(events.len(), 3);
        assert_eq!(finish_count(&out), 1);
        assert_eq!(events[1].json().unwrap()["choices"][0]["delta"]["content"], "tail");
        assert!(events[2].is_done());
    }

    #[test]
    fn stream_without_done_gets_terminator() {
        let input = "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}]}";
        let out = apply_chunks(&mut combine_finish_chunk(), &[input]);
        assert_eq!(
            out,
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}]}\n\ndata: [DONE]\n\n"
        );
    }
}
