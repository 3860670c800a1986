//! Server-sent-event passthrough framing.
//!
//! A stateful scanner consumes the upstream body chunk by chunk, carrying
//! partial lines across chunk boundaries. Only `data:` events are forwarded,
//! re-framed as `data: <payload>\n\n` and flushed per event; an upstream
//! `[DONE]` ends the stream and exactly one terminal `data: [DONE]\n\n` is
//! always emitted. Usage for a streamed response is recorded once when the
//! stream finishes, or on drop if the client disconnects first.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream, StreamExt};

use crate::db::UsageRow;
use crate::error::GatewayError;
use crate::providers::ChatStream;
use crate::queue::WorkQueue;

const DONE_SENTINEL: &str = "[DONE]";
const TERMINAL_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Incremental scanner over an upstream SSE body.
///
/// Feed it raw chunks as they arrive; it buffers incomplete lines, drops
/// blank lines, comments and non-`data:` fields, and returns re-framed
/// events ready to write to the client. Once the upstream `[DONE]` sentinel
/// is seen the scanner goes quiet for good.
struct EventScanner {
    carry: Vec<u8>,
    done: bool,
}

impl EventScanner {
    fn new() -> Self {
        EventScanner {
            carry: Vec::new(),
            done: false,
        }
    }

    fn scan(&mut self, chunk: &[u8]) -> Bytes {
        if self.done {
            return Bytes::new();
        }
        self.carry.extend_from_slice(chunk);

        let mut out: Vec<u8> = Vec::new();
        while let Some(line) = self.next_line() {
            let Some(payload) = event_payload(&line) else {
                continue;
            };
            if payload.trim() == DONE_SENTINEL {
                self.done = true;
                break;
            }
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(payload.as_bytes());
            out.extend_from_slice(b"\n\n");
        }
        Bytes::from(out)
    }

    /// Pop the next complete line out of the carry buffer, stripping the
    /// trailing newline (and carriage return, for CRLF upstreams).
    fn next_line(&mut self) -> Option<String> {
        let newline = self.carry.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.carry.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).to_string())
    }
}

/// The payload of a `data:` line, or `None` for anything else (blank lines,
/// comments, `event:`/`id:` fields).
fn event_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Re-frame an upstream byte stream as clean SSE events.
///
/// `on_complete` runs once, when the framed stream ends (upstream `[DONE]` or
/// EOF), immediately before the terminal frame is emitted.
pub fn frame_events<S, E, F>(upstream: S, on_complete: F) -> impl Stream<Item = Result<Bytes, io::Error>>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: ToString,
    F: FnOnce(),
{
    let mut scanner = EventScanner::new();

    upstream
        .map(move |result| match result {
            Ok(chunk) => Ok(scanner.scan(&chunk)),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        })
        .chain(stream::once(async move {
            on_complete();
            Ok(Bytes::from_static(TERMINAL_FRAME))
        }))
        .filter(|result| {
            // Drop empty chunks so every write is a whole event.
            let keep = match result {
                Ok(bytes) => !bytes.is_empty(),
                Err(_) => true,
            };
            std::future::ready(keep)
        })
}

/// Build the client-facing streaming response. The upstream status code is
/// preserved and the upstream body is dropped (closing the connection) when
/// the framed stream is done.
pub fn streaming_response(upstream: ChatStream, finalizer: UsageFinalizer) -> Response {
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);

    let complete = finalizer.clone();
    let framed = frame_events(upstream.response.bytes_stream(), move || complete.fire());

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(framed))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to build streaming response");
            GatewayError::Internal("streaming response unavailable".to_string()).into_response()
        });

    // Disconnect safety net: if the client goes away before the stream ends,
    // dropping the response fires the finalizer instead.
    response.extensions_mut().insert(finalizer);
    response
}

/// Records the usage row for a streamed response exactly once.
#[derive(Clone)]
pub struct UsageFinalizer {
    inner: Arc<FinalizerInner>,
}

struct FinalizerInner {
    queue: WorkQueue<UsageRow>,
    row: UsageRow,
    started: Instant,
    fired: AtomicBool,
}

impl UsageFinalizer {
    pub fn new(queue: WorkQueue<UsageRow>, row: UsageRow, started: Instant) -> Self {
        UsageFinalizer {
            inner: Arc::new(FinalizerInner {
                queue,
                row,
                started,
                fired: AtomicBool::new(false),
            }),
        }
    }

    pub fn fire(&self) {
        self.inner.fire();
    }
}

impl FinalizerInner {
    fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut row = self.row.clone();
        row.response_time_ms = self.started.elapsed().as_millis() as i64;
        if let Err(e) = self.queue.enqueue(row) {
            tracing::warn!(error = %e, "failed to enqueue streaming usage row");
        }
    }
}

impl Drop for FinalizerInner {
    fn drop(&mut self) {
        self.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[test]
    fn event_payload_only_accepts_data_lines() {
        assert_eq!(event_payload("data: hello"), Some("hello"));
        assert_eq!(event_payload("data:hello"), Some("hello"));
        assert_eq!(event_payload("data: [DONE]"), Some("[DONE]"));
        assert_eq!(event_payload("event: message"), None);
        assert_eq!(event_payload(": comment"), None);
        assert_eq!(event_payload(""), None);
    }

    #[test]
    fn scanner_reassembles_partial_lines() {
        let mut scanner = EventScanner::new();
        assert!(scanner.scan(b"data: {\"id\":").is_empty());
        assert_eq!(scanner.scan(b"1}\n"), &b"data: {\"id\":1}\n\n"[..]);
        assert!(scanner.carry.is_empty());
    }

    #[test]
    fn scanner_strips_crlf() {
        let mut scanner = EventScanner::new();
        assert_eq!(scanner.scan(b"data: ok\r\n"), &b"data: ok\n\n"[..]);
    }

    #[test]
    fn scanner_goes_quiet_after_done() {
        let mut scanner = EventScanner::new();
        assert_eq!(
            scanner.scan(b"data: {\"x\":1}\n\ndata: [DONE]\n\n"),
            &b"data: {\"x\":1}\n\n"[..]
        );
        assert!(scanner.scan(b"data: {\"late\":true}\n\n").is_empty());
    }

    #[test]
    fn scanner_ignores_non_event_lines() {
        let mut scanner = EventScanner::new();
        assert_eq!(
            scanner.scan(b": keep-alive\n\nevent: message\ndata: {\"x\":1}\n\n"),
            &b"data: {\"x\":1}\n\n"[..]
        );
    }

    async fn collect_frames(chunks: Vec<&'static str>) -> (Vec<String>, usize) {
        let completions = Arc::new(AtomicUsize::new(0));
        let completions_clone = Arc::clone(&completions);
        let upstream = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::convert::Infallible>(Bytes::from(c))),
        );
        let frames: Vec<String> = frame_events(upstream, move || {
            completions_clone.fetch_add(1, Ordering::SeqCst);
        })
        .map(|r| String::from_utf8(r.unwrap().to_vec()).unwrap())
        .collect()
        .await;
        (frames, completions.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn passes_events_through_verbatim_with_single_done() {
        let (frames, completions) = collect_frames(vec![
            "data: {\"delta\":\"hi\"}\n\n",
            "data: {\"delta\":\" there\"}\n\ndata: [DONE]\n\n",
        ])
        .await;
        assert_eq!(
            frames,
            vec![
                "data: {\"delta\":\"hi\"}\n\n",
                "data: {\"delta\":\" there\"}\n\n",
                "data: [DONE]\n\n",
            ]
        );
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn reassembles_events_split_across_chunks() {
        let (frames, _) = collect_frames(vec!["data: {\"id\"", ":1}\n", "\n"]).await;
        assert_eq!(frames, vec!["data: {\"id\":1}\n\n", "data: [DONE]\n\n"]);
    }

    #[tokio::test]
    async fn emits_terminal_done_without_upstream_done() {
        let (frames, completions) = collect_frames(vec!["data: {\"x\":1}\n\n"]).await;
        assert_eq!(frames, vec!["data: {\"x\":1}\n\n", "data: [DONE]\n\n"]);
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn suppresses_frames_after_upstream_done() {
        let (frames, _) = collect_frames(vec![
            "data: {\"x\":1}\n\ndata: [DONE]\n\n",
            "data: {\"late\":true}\n\n",
        ])
        .await;
        assert_eq!(frames, vec!["data: {\"x\":1}\n\n", "data: [DONE]\n\n"]);
    }

    fn test_row() -> UsageRow {
        UsageRow {
            id: Uuid::new_v4(),
            api_key_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            model_name: "gpt-4o".to_string(),
            endpoint: "/v1/chat/completions?stream=true".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            reasoning_tokens: 0,
            response_time_ms: 0,
            status_code: 200,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn finalizer_fires_exactly_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let queue = WorkQueue::for_test("usage", tx);
        let finalizer = UsageFinalizer::new(queue, test_row(), Instant::now());

        finalizer.fire();
        finalizer.fire();
        drop(finalizer);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn finalizer_fires_on_drop() {
        let (tx, mut rx) = mpsc::channel(4);
        let queue = WorkQueue::for_test("usage", tx);
        let finalizer = UsageFinalizer::new(queue, test_row(), Instant::now());
        drop(finalizer);
        assert!(rx.try_recv().is_ok());
    }
}
