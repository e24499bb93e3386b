//! Request/response correlation over a local server's standard streams.
//!
//! One reader task owns the server's output and dispatches every parsed frame
//! by id to the matching pending request. Callers never scan output
//! themselves, so the per-frame cost does not grow with the number of calls in
//! flight.

use super::protocol::{CallRequest, CallResponse, FrameBuffer};
use crate::server::{BoxedReader, BoxedWriter, ProcessHandles};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;
const DIAGNOSTICS_LIMIT_BYTES: usize = 64 * 1024;

type PendingSender = oneshot::Sender<Result<String, String>>;

#[derive(Debug, Error)]
pub(crate) enum LocalCallError {
    #[error("tool server output closed")]
    Closed,
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write request: {0}")]
    Write(#[from] std::io::Error),
    #[error("{0}")]
    Remote(String),
    #[error("timed out")]
    TimedOut,
}

struct ChannelState {
    pending: Mutex<HashMap<u64, PendingSender>>,
    closed: AtomicBool,
}

pub struct StdioChannel {
    server_name: String,
    stdin: Mutex<BoxedWriter>,
    state: Arc<ChannelState>,
    next_request_id: AtomicU64,
    diagnostics: Arc<Mutex<Vec<u8>>>,
}

impl StdioChannel {
    pub(crate) fn attach(server_name: String, handles: ProcessHandles) -> Self {
        let ProcessHandles {
            stdin,
            stdout,
            stderr,
        } = handles;

        let state = Arc::new(ChannelState {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let diagnostics = Arc::new(Mutex::new(Vec::new()));

        Self::spawn_stdout_reader(server_name.clone(), stdout, state.clone());
        if let Some(stderr) = stderr {
            Self::spawn_stderr_drain(server_name.clone(), stderr, diagnostics.clone());
        }

        Self {
            server_name,
            stdin: Mutex::new(stdin),
            state,
            next_request_id: AtomicU64::new(1),
            diagnostics,
        }
    }

    fn spawn_stdout_reader(
        server_name: String,
        mut stdout: BoxedReader,
        state: Arc<ChannelState>,
    ) {
        tokio::spawn(async move {
            let mut frames = FrameBuffer::default();
            let mut chunk = vec![0u8; READ_CHUNK_BYTES];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(read) => {
                        for frame in frames.push(&chunk[..read]) {
                            Self::dispatch_frame(&server_name, &state, &frame).await;
                        }
                    }
                    Err(err) => {
                        warn!(server = %server_name, error = %err, "Tool server output failed");
                        break;
                    }
                }
            }
            for frame in frames.finish() {
                Self::dispatch_frame(&server_name, &state, &frame).await;
            }
            Self::close(&server_name, &state).await;
        });
    }

    fn spawn_stderr_drain(
        server_name: String,
        mut stderr: BoxedReader,
        diagnostics: Arc<Mutex<Vec<u8>>>,
    ) {
        tokio::spawn(async move {
            let mut chunk = vec![0u8; READ_CHUNK_BYTES];
            while let Ok(read) = stderr.read(&mut chunk).await {
                if read == 0 {
                    break;
                }
                trace!(server = %server_name, bytes = read, "Tool server stderr");
                let mut buffer = diagnostics.lock().await;
                buffer.extend_from_slice(&chunk[..read]);
                truncate_front(&mut buffer, DIAGNOSTICS_LIMIT_BYTES);
            }
        });
    }

    async fn dispatch_frame(server_name: &str, state: &ChannelState, frame: &str) {
        let response = match serde_json::from_str::<CallResponse>(frame) {
            Ok(response) => response,
            Err(err) => {
                debug!(
                    server = %server_name,
                    error = %err,
                    "Skipping unparseable tool server frame"
                );
                return;
            }
        };
        let Some(request_id) = response.request_id() else {
            debug!(server = %server_name, "Skipping tool server frame without numeric id");
            return;
        };

        let sender = state.pending.lock().await.remove(&request_id);
        match sender {
            Some(tx) => {
                debug!(server = %server_name, request_id, "Received tool server response");
                let _ = tx.send(response.into_outcome());
            }
            None => {
                warn!(
                    server = %server_name,
                    request_id,
                    "Dropping tool server response with no pending request"
                );
            }
        }
    }

    /// Fails every pending request; dropping the senders wakes the waiters.
    async fn close(server_name: &str, state: &ChannelState) {
        let mut pending = state.pending.lock().await;
        state.closed.store(true, Ordering::SeqCst);
        if !pending.is_empty() {
            debug!(
                server = %server_name,
                pending = pending.len(),
                "Tool server output closed with requests in flight"
            );
        }
        pending.clear();
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) async fn call(
        &self,
        tool_name: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> Result<String, LocalCallError> {
        let request_id = self.next_request_id();
        let request = CallRequest::new(request_id, tool_name, arguments);
        let mut payload = serde_json::to_string(&request)?;
        payload.push('\n');

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.state.pending.lock().await;
            if self.state.closed.load(Ordering::SeqCst) {
                return Err(LocalCallError::Closed);
            }
            pending.insert(request_id, tx);
        }

        debug!(
            server = %self.server_name,
            tool = %tool_name,
            request_id,
            bytes = payload.len(),
            "Writing tool server request"
        );
        // One deadline for the write and the reply.
        let exchange = async {
            if let Err(err) = self.write_frame(payload.as_bytes()).await {
                return Err(LocalCallError::Write(err));
            }
            match rx.await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(message)) => Err(LocalCallError::Remote(message)),
                Err(_) => Err(LocalCallError::Closed),
            }
        };
        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(
                    server = %self.server_name,
                    tool = %tool_name,
                    request_id,
                    timeout_ms = timeout.as_millis(),
                    "Tool server request timed out"
                );
                Err(LocalCallError::TimedOut)
            }
        };
        if outcome.is_err() {
            self.state.pending.lock().await.remove(&request_id);
        }
        outcome
    }

    async fn write_frame(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(payload).await?;
        stdin.flush().await
    }

    pub async fn pending_count(&self) -> usize {
        self.state.pending.lock().await.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Raw stderr is kept as bytes so characters split across reads decode
    /// intact.
    pub async fn diagnostics(&self) -> String {
        String::from_utf8_lossy(&self.diagnostics.lock().await).into_owned()
    }
}

/// Keeps the last `limit` bytes, skipping UTF-8 continuation bytes at the cut.
fn truncate_front(buffer: &mut Vec<u8>, limit: usize) {
    if buffer.len() <= limit {
        return;
    }
    let mut cut = buffer.len() - limit;
    while cut < buffer.len() && buffer[cut] & 0xC0 == 0x80 {
        cut += 1;
    }
    buffer.drain(..cut);
}
