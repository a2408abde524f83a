//! Keyword-intercepting buffer engine.
//!
//! Scans an unbounded chunked text stream for an exact keyword that may be
//! split across chunk boundaries. While no keyword is in view, at most
//! `keyword.len() - 1` bytes are held back (the longest tail that could still
//! grow into the keyword). Once the keyword is found, everything after it is
//! handed to an [`InterceptStrategy`] which decides what the keyword and its
//! continuation become.

use super::ChunkTransform;

/// Outcome of classifying the text that follows a keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Replace the keyword plus the first `consumed` bytes after it with
    /// `replacement`, then keep scanning the rest.
    Matched { consumed: usize, replacement: String },
    /// Replace the keyword and everything after it with `replacement`, then
    /// end the stream.
    Terminal { replacement: String },
    /// False alarm: emit the keyword verbatim and keep scanning after it.
    NotMatched,
    /// Not decidable yet; wait for more input.
    Pending,
}

/// What a concrete stream patch plugs into [`KeywordInterceptor`].
pub trait InterceptStrategy: Send {
    fn keyword(&self) -> &'static str;

    /// Classify `post`, the text seen so far after the keyword. With
    /// `at_end` set no further input will arrive; `Pending` is then treated
    /// as `NotMatched`.
    fn classify(&mut self, post: &str, at_end: bool) -> Verdict;
}

#[derive(Debug)]
pub struct KeywordInterceptor<S> {
    strategy: S,
    held: String,
    intercepted: bool,
    terminated: bool,
}

impl<S: InterceptStrategy> KeywordInterceptor<S> {
    pub fn new(strategy: S) -> Self {
        Self {
            strategy,
            held: String::new(),
            intercepted: false,
            terminated: false,
        }
    }

    /// Bytes currently held back awaiting classification.
    #[cfg(test)]
    pub(crate) fn held_len(&self) -> usize {
        self.held.len()
    }

    fn process(&mut self, mut buf: String, at_end: bool, out: &mut Vec<String>) {
        let keyword = self.strategy.keyword();

        loop {
            if self.intercepted {
                let post_start = keyword.len().min(buf.len());
                let verdict = match self.strategy.classify(&buf[post_start..], at_end) {
                    Verdict::Pending if at_end => Verdict::NotMatched,
                    other => other,
                };
                match verdict {
                    Verdict::Matched {
                        consumed,
                        replacement,
                    } => {
                        emit(out, &replacement);
                        let cut = (post_start + consumed).min(buf.len());
                        buf = buf.split_off(cut);
                        self.intercepted = false;
                    }
                    Verdict::Terminal { replacement } => {
                        emit(out, &replacement);
                        self.intercepted = false;
                        self.terminated = true;
                        return;
                    }
                    Verdict::NotMatched => {
                        emit(out, &buf[..post_start]);
                        buf = buf.split_off(post_start);
                        self.intercepted = false;
                    }
                    Verdict::Pending => {
                        self.held = buf;
                        return;
                    }
                }
                continue;
            }

            if let Some(idx) = buf.find(keyword) {
                emit(out, &buf[..idx]);
                buf = buf.split_off(idx);
                self.intercepted = true;
                continue;
            }

            let hold = if at_end {
                0
            } else {
                partial_suffix_len(&buf, keyword)
            };
            let split = buf.len() - hold;
            emit(out, &buf[..split]);
            self.held = buf.split_off(split);
            return;
        }
    }
}

impl<S: InterceptStrategy> ChunkTransform for KeywordInterceptor<S> {
    fn transform(&mut self, chunk: &str, out: &mut Vec<String>) {
        if self.terminated {
            return;
        }
        let mut buf = std::mem::take(&mut self.held);
        buf.push_str(chunk);
        self.process(buf, false, out);
    }

    fn flush(&mut self, out: &mut Vec<String>) {
        if self.terminated {
            return;
        }
        let buf = std::mem::take(&mut self.held);
        if buf.is_empty() && !self.intercepted {
            return;
        }
        self.process(buf, true, out);
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

fn emit(out: &mut Vec<String>, text: &str) {
    if !text.is_empty() {
        out.push(text.to_string());
    }
}

/// Length of the longest suffix of `buf` that is a proper prefix of
/// `keyword`. Compared bytewise; the result always falls on a char boundary
/// because the keyword itself is valid UTF-8.
pub fn partial_suffix_len(buf: &str, keyword: &str) -> usize {
    let (b, k) = (buf.as_bytes(), keyword.as_bytes());
    let max = b.len().min(k.len().saturating_sub(1));
    (1..=max)
        .rev()
        .find(|&n| k.starts_with(&b[b.len() - n..]))
        .unwrap_or(0)
}
