use super::protocol::{result_text, RemoteCallRequest, RemoteCallResponse, TOOLS_CALL_METHOD};
use crate::error::{BridgeError, BridgeResult};
use crate::server::RemoteConnection;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
        }
    }
}

pub fn build_http_client(settings: &HttpSettings) -> BridgeResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.request_timeout)
        .build()
        .map_err(|err| BridgeError::config(format!("cannot build HTTP client: {err}")))
}

pub(crate) fn tools_call_url(base_url: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), TOOLS_CALL_METHOD)
}

fn apply_connection_headers(
    mut request: reqwest::RequestBuilder,
    connection: &RemoteConnection,
) -> reqwest::RequestBuilder {
    for (name, value) in &connection.headers {
        if name.eq_ignore_ascii_case("content-type") {
            continue;
        }
        request = request.header(name.as_str(), value.as_str());
    }
    request.header("Content-Type", JSON_CONTENT_TYPE)
}

pub(crate) async fn call_remote(
    client: &reqwest::Client,
    server_name: &str,
    connection: &RemoteConnection,
    tool_name: &str,
    arguments: &Value,
) -> BridgeResult<String> {
    let connection_error = |message: String| BridgeError::Connection {
        server_name: server_name.to_string(),
        message,
    };

    let url = tools_call_url(&connection.url);
    let payload = serde_json::to_vec(&RemoteCallRequest::new(tool_name, arguments))
        .map_err(|err| BridgeError::server(server_name, tool_name, err.to_string()))?;
    debug!(server = %server_name, tool = %tool_name, url = %url, "Sending remote tool call");

    let response = apply_connection_headers(client.post(&url), connection)
        .body(payload)
        .send()
        .await
        .map_err(|err| connection_error(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(connection_error(format!("HTTP error: {status}")));
    }

    let body = response
        .bytes()
        .await
        .map_err(|err| connection_error(err.to_string()))?;
    let parsed = if body.iter().all(u8::is_ascii_whitespace) {
        RemoteCallResponse::default()
    } else {
        serde_json::from_slice::<RemoteCallResponse>(&body).map_err(|err| {
            BridgeError::server(server_name, tool_name, format!("invalid response body: {err}"))
        })?
    };
    Ok(result_text(parsed.result))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Single-shot HTTP responder for exercising the remote path.

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    pub struct CapturedRequest {
        pub head: String,
        pub body: String,
    }

    /// Serves one request with the given status line and body, returning the
    /// base URL and a receiver for the captured request.
    pub async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, oneshot::Receiver<CapturedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut raw = Vec::new();
            let mut chunk = [0u8; 1024];
            let (head, body_start, content_length) = loop {
                let read = socket.read(&mut chunk).await.expect("read");
                if read == 0 {
                    return;
                }
                raw.extend_from_slice(&chunk[..read]);
                if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&raw[..pos]).to_string();
                    let content_length = head
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    break (head, pos + 4, content_length);
                }
            };
            while raw.len() < body_start + content_length {
                let read = socket.read(&mut chunk).await.expect("read body");
                if read == 0 {
                    break;
                }
                raw.extend_from_slice(&chunk[..read]);
            }
            let request_body = String::from_utf8_lossy(&raw[body_start..]).to_string();

            let response = format!(
                "HTTP/1.1 {status}\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
            let _ = tx.send(CapturedRequest {
                head,
                body: request_body,
            });
        });

        (format!("http://{addr}"), rx)
    }
}
