//! Framed, backpressure-aware forwarding of a model's streamed answer.
//!
//! [`handle_streaming_response`] pulls text fragments from a source stream and
//! writes each one to an async sink as a single NDJSON record
//! (`{"t":"text","v":...}`), while capturing the full text for a completion
//! callback. The pump is strictly sequential: a fragment is pulled only after
//! the previous record was accepted by the sink, so a slow consumer throttles
//! the producer and nothing accumulates beyond the sink's own buffer.

use futures_util::{stream, FutureExt, Stream, StreamExt};
use serde::Serialize;
use std::error::Error as StdError;
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::{pin, Pin};
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::PollSender;
use tracing::{debug, warn};

/// Content type for HTTP responses carrying framed records.
pub const STREAM_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
pub const STREAM_TRANSFER_ENCODING: &str = "chunked";

/// One record on the output channel. The `t` tag leaves room for record kinds
/// other than text on the same stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "v")]
pub enum StreamEvent {
    #[serde(rename = "text")]
    Text(String),
}

impl StreamEvent {
    /// Serialized record including the terminating newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream source failed: {0}")]
    Source(String),
    #[error("stream sink failed: {0}")]
    Sink(#[from] std::io::Error),
    #[error("failed to encode stream record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type CompletionError = Box<dyn StdError + Send + Sync>;
pub type CompletionFuture = Pin<Box<dyn Future<Output = Result<(), CompletionError>> + Send>>;
pub type CompletionCallback = Box<dyn FnOnce(String) -> CompletionFuture + Send>;

/// Boxes an async closure as a [`CompletionCallback`].
pub fn on_complete<F, Fut>(callback: F) -> CompletionCallback
where
    F: FnOnce(String) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), CompletionError>> + Send + 'static,
{
    Box::new(move |text| Box::pin(callback(text)))
}

/// Output side of [`handle_streaming_response`].
///
/// Closing a byte pipe looks the same whether the answer finished or was cut
/// short, so sinks expose `abort` to fail the output for their consumer.
pub trait ResponseSink: AsyncWrite + Unpin {
    fn abort(&mut self, error: &StreamError);
}

impl<T: ResponseSink + ?Sized> ResponseSink for &mut T {
    fn abort(&mut self, error: &StreamError) {
        (**self).abort(error);
    }
}

/// In-memory capture; there is no consumer to notify.
impl ResponseSink for Vec<u8> {
    fn abort(&mut self, _error: &StreamError) {}
}

/// The process exit status reports failures written to stdout.
impl ResponseSink for tokio::io::Stdout {
    fn abort(&mut self, _error: &StreamError) {}
}

/// Creates a bounded record channel. The receiving half is a byte stream
/// suitable as an HTTP response body; at most `capacity` writes are buffered
/// before the pump waits for the consumer.
pub fn body_channel(capacity: usize) -> (BodySender, BodyReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (abort_tx, abort_rx) = oneshot::channel();
    (
        BodySender {
            chunks: PollSender::new(tx),
            abort: Some(abort_tx),
        },
        BodyReceiver {
            chunks: rx,
            abort: abort_rx,
        },
    )
}

pub struct BodySender {
    chunks: PollSender<Vec<u8>>,
    abort: Option<oneshot::Sender<String>>,
}

impl AsyncWrite for BodySender {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Err(err) = ready!(self.chunks.poll_reserve(cx)) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, err)));
        }
        match self.chunks.send_item(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(err) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, err))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.abort = None;
        self.chunks.close();
        Poll::Ready(Ok(()))
    }
}

impl ResponseSink for BodySender {
    fn abort(&mut self, error: &StreamError) {
        if let Some(abort) = self.abort.take() {
            let _ = abort.send(error.to_string());
        }
        self.chunks.close();
    }
}

pub struct BodyReceiver {
    chunks: mpsc::Receiver<Vec<u8>>,
    abort: oneshot::Receiver<String>,
}

impl BodyReceiver {
    /// Yields buffered chunks in order. An aborted sender ends the stream
    /// with an error item instead of a clean end.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Vec<u8>>> + Send + 'static {
        stream::unfold(Some(self), |state| async move {
            let mut receiver = state?;
            match receiver.chunks.recv().await {
                Some(chunk) => Some((Ok(chunk), Some(receiver))),
                None => match receiver.abort.await {
                    Ok(reason) => Some((Err(io::Error::other(reason)), None)),
                    Err(_) => None,
                },
            }
        })
    }
}

/// Runs the pipeline to completion and returns the captured text.
///
/// On source, encode or sink failure the sink is aborted rather than shut
/// down, and the callback is not invoked. The source is dropped on every
/// path, releasing whatever it holds.
pub async fn handle_streaming_response<S, E, W>(
    source: S,
    mut sink: W,
    completion: Option<CompletionCallback>,
) -> Result<String, StreamError>
where
    S: Stream<Item = Result<String, E>>,
    E: Display,
    W: ResponseSink,
{
    let captured = match pump(source, &mut sink).await {
        Ok(captured) => captured,
        Err(err) => {
            sink.abort(&err);
            return Err(err);
        }
    };
    drop(sink);

    if let Some(callback) = completion {
        run_completion(callback, captured.clone()).await;
    }
    Ok(captured)
}

async fn pump<S, E, W>(source: S, sink: &mut W) -> Result<String, StreamError>
where
    S: Stream<Item = Result<String, E>>,
    E: Display,
    W: AsyncWrite + Unpin,
{
    let mut source = pin!(source);
    let mut captured = String::new();
    let mut records = 0usize;

    while let Some(fragment) = source.next().await {
        let fragment = match fragment {
            Ok(fragment) => fragment,
            Err(err) => {
                warn!(records, error = %err, "Stream source failed; aborting response");
                return Err(StreamError::Source(err.to_string()));
            }
        };
        captured.push_str(&fragment);
        let line = StreamEvent::Text(fragment).to_line()?;
        sink.write_all(line.as_bytes()).await?;
        records += 1;
    }

    sink.flush().await?;
    sink.shutdown().await?;
    debug!(records, bytes = captured.len(), "Stream finished");
    Ok(captured)
}

/// Callback failures, panics included, are logged and discarded: the stream
/// has already been delivered.
async fn run_completion(callback: CompletionCallback, text: String) {
    match AssertUnwindSafe(callback(text)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "Stream completion callback failed"),
        Err(_) => warn!("Stream completion callback panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn parse_records(output: &str) -> Vec<serde_json::Value> {
        output
            .lines()
            .map(|line| serde_json::from_str(line).expect("record json"))
            .collect()
    }

    #[test]
    fn text_event_serializes_to_tagged_record() {
        let line = StreamEvent::Text("hi \"there\"".to_string())
            .to_line()
            .expect("encode");
        assert_eq!(line, "{\"t\":\"text\",\"v\":\"hi \\\"there\\\"\"}\n");
    }

    #[tokio::test]
    async fn records_and_callback_match_fragments() {
        let fragments = vec!["Hel", "lo,", " wor", "ld\n", "", "ünï"];
        let expected: String = fragments.concat();
        let source = stream::iter(
            fragments
                .iter()
                .map(|f| Ok::<_, std::io::Error>(f.to_string()))
                .collect::<Vec<_>>(),
        );

        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let callback = on_complete(move |text| async move {
            seen.lock().expect("lock").push(text);
            Ok::<(), CompletionError>(())
        });

        let mut sink = Vec::new();
        let captured = handle_streaming_response(source, &mut sink, Some(callback))
            .await
            .expect("stream should finish");

        assert_eq!(captured, expected);
        assert_eq!(*calls.lock().expect("lock"), vec![expected.clone()]);

        let output = String::from_utf8(sink).expect("utf8");
        let records = parse_records(&output);
        assert_eq!(records.len(), fragments.len());
        assert!(records.iter().all(|r| r["t"] == "text"));
        let joined: String = records
            .iter()
            .map(|r| r["v"].as_str().expect("v").to_string())
            .collect();
        assert_eq!(joined, expected);
    }

    async fn collect_body(body: BodyReceiver) -> (String, Option<io::Error>) {
        let mut output = Vec::new();
        let mut chunks = pin!(body.into_stream());
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => output.extend_from_slice(&bytes),
                Err(err) => return (String::from_utf8(output).expect("utf8"), Some(err)),
            }
        }
        (String::from_utf8(output).expect("utf8"), None)
    }

    #[tokio::test]
    async fn withheld_drain_stops_pulling() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        let source = stream::iter(0..4).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(format!("fragment-{i}"))
        });

        let (sink, body) = body_channel(1);
        let pump = tokio::spawn(handle_streaming_response(source, sink, None));

        tokio::time::sleep(Duration::from_millis(50)).await;
        // One record sits in the channel, the second waits for room.
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
        assert!(!pump.is_finished());

        let (output, failure) = collect_body(body).await;
        let captured = pump.await.expect("join").expect("stream should finish");

        assert!(failure.is_none());
        assert_eq!(pulls.load(Ordering::SeqCst), 4);
        assert_eq!(parse_records(&output).len(), 4);
        assert_eq!(captured, "fragment-0fragment-1fragment-2fragment-3");
    }

    #[tokio::test]
    async fn source_failure_aborts_without_callback() {
        let source = stream::iter(vec![
            Ok("partial".to_string()),
            Err("model disconnected".to_string()),
            Ok("never".to_string()),
        ]);
        let called = Arc::new(AtomicUsize::new(0));
        let flag = called.clone();
        let callback = on_complete(move |_text| async move {
            flag.fetch_add(1, Ordering::SeqCst);
            Ok::<(), CompletionError>(())
        });

        let (sink, body) = body_channel(8);
        let result = handle_streaming_response(source, sink, Some(callback)).await;

        match result {
            Err(StreamError::Source(message)) => assert_eq!(message, "model disconnected"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(called.load(Ordering::SeqCst), 0);

        let (output, failure) = collect_body(body).await;
        let records = parse_records(&output);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["v"], "partial");
        let failure = failure.expect("consumer should see the abort");
        assert!(failure.to_string().contains("model disconnected"));
    }

    #[tokio::test]
    async fn truncated_and_finished_answers_differ_for_consumer() {
        let finished = stream::iter(vec![Ok::<_, String>("a".to_string())]);
        let truncated = stream::iter(vec![Ok("a".to_string()), Err("boom".to_string())]);

        let (sink, body) = body_channel(8);
        handle_streaming_response(finished, sink, None)
            .await
            .expect("clean finish");
        let (clean_output, clean_failure) = collect_body(body).await;

        let (sink, body) = body_channel(8);
        handle_streaming_response(truncated, sink, None)
            .await
            .expect_err("source failure");
        let (cut_output, cut_failure) = collect_body(body).await;

        assert_eq!(clean_output, cut_output);
        assert!(clean_failure.is_none());
        assert!(cut_failure.is_some());
    }

    #[tokio::test]
    async fn closed_consumer_reports_sink_error() {
        let source = stream::iter(vec![Ok::<_, String>("x".to_string())]);
        let (sink, body) = body_channel(1);
        drop(body);

        let result = handle_streaming_response(source, sink, None).await;
        assert!(matches!(result, Err(StreamError::Sink(_))));
    }

    #[tokio::test]
    async fn callback_failure_does_not_fail_stream() {
        let source = stream::iter(vec![Ok::<_, std::io::Error>("done".to_string())]);
        let callback = on_complete(|_text| async move {
            Err::<(), CompletionError>("database unavailable".into())
        });

        let mut sink = Vec::new();
        let captured = handle_streaming_response(source, &mut sink, Some(callback))
            .await
            .expect("callback errors are swallowed");
        assert_eq!(captured, "done");
        assert_eq!(sink, b"{\"t\":\"text\",\"v\":\"done\"}\n");
    }

    #[tokio::test]
    async fn callback_panic_does_not_fail_stream() {
        let source = stream::iter(vec![Ok::<_, std::io::Error>("x".to_string())]);
        let callback = on_complete(|text| async move {
            if !text.is_empty() {
                panic!("persistence bug");
            }
            Ok::<(), CompletionError>(())
        });

        let mut sink = Vec::new();
        let captured = handle_streaming_response(source, &mut sink, Some(callback)).await;
        assert_eq!(captured.expect("panic is contained"), "x");
    }

    #[tokio::test]
    async fn empty_source_closes_sink_and_reports_empty_text() {
        let source = stream::empty::<Result<String, std::io::Error>>();
        let (sink, body) = body_channel(4);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let callback = on_complete(move |text| async move {
            seen.lock().expect("lock").push(text);
            Ok::<(), CompletionError>(())
        });

        let captured = handle_streaming_response(source, sink, Some(callback))
            .await
            .expect("empty stream finishes");
        assert_eq!(captured, "");
        assert_eq!(*calls.lock().expect("lock"), vec![String::new()]);

        let (output, failure) = collect_body(body).await;
        assert!(output.is_empty());
        assert!(failure.is_none());
    }
}
