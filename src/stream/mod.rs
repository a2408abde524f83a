//! Streaming body transforms.
//!
//! A [`ChunkTransform`] sees the upstream body as decoded text chunks with
//! arbitrary boundaries and produces output text. [`transform_body`] adapts a
//! transform onto a byte stream: it decodes UTF-8 across chunk boundaries,
//! polls upstream only after the previous output has been taken, and drops
//! the upstream stream as soon as the transform reports termination.

pub mod combine_finish;
pub mod finish_reason;
pub mod keyword;
pub mod think_tag;

pub use combine_finish::{combine_finish_chunk, CombineFinishChunk};
pub use finish_reason::{finish_reason_cleaner, FinishReasonCleaner};
pub use keyword::{InterceptStrategy, KeywordInterceptor, Verdict};
pub use think_tag::ReasoningToThinkTag;

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::exchange::BodyStream;

/// Stateful text-stream rewrite stage.
pub trait ChunkTransform: Send {
    /// Consume one chunk, appending any output to `out`.
    fn transform(&mut self, chunk: &str, out: &mut Vec<String>);

    /// End of stream: resolve outstanding state instead of dropping it.
    fn flush(&mut self, out: &mut Vec<String>);

    /// Once true, no further input is consumed and the stream ends after the
    /// already-produced output.
    fn is_terminated(&self) -> bool {
        false
    }
}

/// Incremental UTF-8 decoding that never splits a code point.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let text = s.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete sequence at the tail: keep it for the next chunk.
                let rest = self.pending.split_off(e.valid_up_to());
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending = rest;
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

struct TransformBody {
    inner: Option<BodyStream>,
    transform: Box<dyn ChunkTransform>,
    decoder: Utf8Decoder,
    queue: VecDeque<Bytes>,
    finished: bool,
}

impl TransformBody {
    fn enqueue(&mut self, out: Vec<String>) {
        self.queue.extend(
            out.into_iter()
                .filter(|s| !s.is_empty())
                .map(Bytes::from),
        );
    }
}

impl Stream for TransformBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(chunk) = this.queue.pop_front() {
                return Poll::Ready(Some(Ok(chunk)));
            }

            if this.finished {
                return Poll::Ready(None);
            }

            if this.transform.is_terminated() {
                // Dropping the upstream body aborts the outbound connection.
                this.inner = None;
                this.finished = true;
                continue;
            }

            let Some(inner) = this.inner.as_mut() else {
                this.finished = true;
                continue;
            };

            match inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let text = this.decoder.decode(&chunk);
                    if !text.is_empty() {
                        let mut out = Vec::new();
                        this.transform.transform(&text, &mut out);
                        this.enqueue(out);
                    }
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => {
                    let mut out = Vec::new();
                    let tail = this.decoder.finish();
                    if !tail.is_empty() {
                        this.transform.transform(&tail, &mut out);
                    }
                    if !this.transform.is_terminated() {
                        this.transform.flush(&mut out);
                    }
                    this.enqueue(out);
                    this.inner = None;
                    this.finished = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Pipe `body` through `transform`.
pub fn transform_body<T>(body: BodyStream, transform: T) -> BodyStream
where
    T: ChunkTransform + 'static,
{
    TransformBody {
        inner: Some(body),
        transform: Box::new(transform),
        decoder: Utf8Decoder::default(),
        queue: VecDeque::new(),
        finished: false,
    }
    .boxed()
}

/// Feed `chunks` through `transform` synchronously and concatenate the output.
pub fn apply_chunks<T: ChunkTransform + ?Sized>(transform: &mut T, chunks: &[&str]) -> String {
    let mut out = Vec::new();
    for chunk in chunks {
        if transform.is_terminated() {
            break;
        }
        transform.transform(chunk, &mut out);
    }
    if !transform.is_terminated() {
        transform.flush(&mut out);
    }
    out.concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    struct Upper;

    impl ChunkTransform for Upper {
        fn transform(&mut self, chunk: &str, out: &mut Vec<String>) {
            out.push(chunk.to_uppercase());
        }

        fn flush(&mut self, out: &mut Vec<String>) {
            out.push("!".into());
        }
    }

    struct StopAfterFirst {
        done: bool,
    }

    impl ChunkTransform for StopAfterFirst {
        fn transform(&mut self, chunk: &str, out: &mut Vec<String>) {
            out.push(chunk.to_string());
            self.done = true;
        }

        fn flush(&mut self, out: &mut Vec<String>) {
            out.push("flushed".into());
        }

        fn is_terminated(&self) -> bool {
            self.done
        }
    }

    async fn collect(body: BodyStream) -> String {
        let chunks: Vec<Bytes> = body.map(|c| c.unwrap()).collect().await;
        String::from_utf8(chunks.concat()).unwrap()
    }

    #[tokio::test]
    async fn multibyte_code_points_survive_byte_splits() {
        let text = "héllo wörld ✓";
        let bytes = text.as_bytes();
        for split in 1..bytes.len() {
            let parts = vec![
                Ok(Bytes::copy_from_slice(&bytes[..split])),
                Ok(Bytes::copy_from_slice(&bytes[split..])),
            ];
            let out = collect(transform_body(stream::iter(parts).boxed(), Upper)).await;
            assert_eq!(out, "HÉLLO WÖRLD ✓!");
        }
    }

    #[tokio::test]
    async fn termination_stops_consuming_upstream() {
        let parts = vec![Ok(Bytes::from("first")), Ok(Bytes::from("second"))];
        let out = collect(transform_body(
            stream::iter(parts).boxed(),
            StopAfterFirst { done: false },
        ))
        .await;
        assert_eq!(out, "first");
    }

    #[test]
    fn apply_chunks_flushes_at_end() {
        assert_eq!(apply_chunks(&mut Upper, &["a", "b"]), "AB!");
    }
}
