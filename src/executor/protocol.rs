use memchr::memchr;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub(crate) const TOOLS_CALL_METHOD: &str = "tools/call";
pub(crate) const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub(crate) struct CallParams<'a> {
    pub name: &'a str,
    pub arguments: &'a Value,
}

/// Request frame written to a local server, one per line.
#[derive(Debug, Serialize)]
pub(crate) struct CallRequest<'a> {
    pub id: u64,
    pub method: &'static str,
    pub params: CallParams<'a>,
}

impl<'a> CallRequest<'a> {
    pub fn new(id: u64, name: &'a str, arguments: &'a Value) -> Self {
        Self {
            id,
            method: TOOLS_CALL_METHOD,
            params: CallParams { name, arguments },
        }
    }
}

/// Body posted to a remote server. Same shape as [`CallRequest`] minus the id.
#[derive(Debug, Serialize)]
pub(crate) struct RemoteCallRequest<'a> {
    pub method: &'static str,
    pub params: CallParams<'a>,
}

impl<'a> RemoteCallRequest<'a> {
    pub fn new(name: &'a str, arguments: &'a Value) -> Self {
        Self {
            method: TOOLS_CALL_METHOD,
            params: CallParams { name, arguments },
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CallResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

impl CallResponse {
    pub fn request_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// `Err` carries the server's error message; an error field wins over a result.
    pub fn into_outcome(self) -> Result<String, String> {
        if let Some(error) = self.error {
            return Err(error
                .message
                .unwrap_or_else(|| "tool server returned an error without a message".to_string()));
        }
        Ok(result_text(self.result))
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RemoteCallResponse {
    #[serde(default)]
    pub result: Option<Value>,
}

/// Missing or null results read as the empty string; non-string JSON keeps its
/// serialized form.
pub(crate) fn result_text(result: Option<Value>) -> String {
    match result {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
    }
}

/// Accumulates output bytes and yields complete frames.
///
/// Frames are newline terminated. A trailing unterminated fragment is also
/// released once it parses as a complete JSON object, so servers that omit
/// the final newline are still answered. A partial frame that outgrows the
/// limit is dropped along with the rest of its line.
pub(crate) struct FrameBuffer {
    buffer: Vec<u8>,
    limit: usize,
    discarding: bool,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }
}

impl FrameBuffer {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            discarding: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let chunk = if self.discarding {
            match memchr(b'\n', chunk) {
                Some(newline) => {
                    self.discarding = false;
                    &chunk[newline + 1..]
                }
                None => return Vec::new(),
            }
        } else {
            chunk
        };

        self.buffer.extend_from_slice(chunk);
        let mut frames = self.drain_lines();
        if let Some(frame) = self.take_complete_remainder() {
            frames.push(frame);
        }
        if self.buffer.len() > self.limit {
            warn!(
                bytes = self.buffer.len(),
                limit = self.limit,
                "Dropping oversized tool server frame"
            );
            self.buffer.clear();
            self.discarding = true;
        }
        frames
    }

    pub fn finish(&mut self) -> Vec<String> {
        let mut frames = self.drain_lines();
        if let Some(text) = decode_frame(&self.buffer) {
            frames.push(text);
        }
        self.buffer.clear();
        frames
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        let mut start = 0;

        while let Some(offset) = memchr(b'\n', &self.buffer[start..]) {
            let newline = start + offset;
            if let Some(text) = decode_frame(&self.buffer[start..newline]) {
                frames.push(text);
            }
            start = newline + 1;
        }

        if start > 0 {
            self.buffer.drain(..start);
        }
        frames
    }

    fn take_complete_remainder(&mut self) -> Option<String> {
        let text = decode_frame(&self.buffer)?;
        if !text.starts_with('{') || !text.ends_with('}') {
            return None;
        }
        serde_json::from_str::<serde::de::IgnoredAny>(&text).ok()?;
        self.buffer.clear();
        Some(text)
    }
}

fn decode_frame(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    (!text.is_empty()).then(|| text.to_string())
}
