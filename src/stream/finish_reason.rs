//! Removes `,"finish_reason":null` from OpenAI-style stream chunks. Some
//! clients treat the mere presence of the key as end of generation.

use super::keyword::{InterceptStrategy, KeywordInterceptor, Verdict};

pub const FINISH_REASON_KEYWORD: &str = ",\"finish_reason\":";

const NULL: &str = "null";

#[derive(Debug, Default)]
pub struct FinishReasonCleaner;

impl InterceptStrategy for FinishReasonCleaner {
    fn keyword(&self) -> &'static str {
        FINISH_REASON_KEYWORD
    }

    fn classify(&mut self, post: &str, at_end: bool) -> Verdict {
        match null_literal(post, at_end) {
            NullLiteral::Yes(consumed) => Verdict::Matched {
                consumed,
                replacement: String::new(),
            },
            NullLiteral::Undecided => Verdict::Pending,
            NullLiteral::No => Verdict::NotMatched,
        }
    }
}

pub fn finish_reason_cleaner() -> KeywordInterceptor<FinishReasonCleaner> {
    KeywordInterceptor::new(FinishReasonCleaner)
}

pub(crate) enum NullLiteral {
    /// `post` begins with optional whitespace and a standalone `null`; the
    /// value is the byte length of both.
    Yes(usize),
    Undecided,
    No,
}

/// Whether the JSON value starting `post` is the `null` literal.
pub(crate) fn null_literal(post: &str, at_end: bool) -> NullLiteral {
    let trimmed = post.trim_start();
    let ws = post.len() - trimmed.len();

    if let Some(rest) = trimmed.strip_prefix(NULL) {
        return match rest.chars().next() {
            Some(c) if c.is_ascii_alphanumeric() || c == '_' => NullLiteral::No,
            Some(_) => NullLiteral::Yes(ws + NULL.len()),
            None if at_end => NullLiteral::Yes(ws + NULL.len()),
            None => NullLiteral::Undecided,
        };
    }

    if NULL.starts_with(trimmed) {
        NullLiteral::Undecided
    } else {
        NullLiteral::No
    }
}
