use super::{
    apply_streamable_http_client_post_headers, apply_streamable_http_protocol_version_header,
    request_id_of, transport_failure, Backoff, Negotiated, RemoteProtocol, RemoteSource,
    ResolvedServer, SessionHooks, MCP_SESSION_ID_HEADER,
};
use crate::mcp::endpoint::{channel_pair, ChannelEnd, Endpoint};
use crate::mcp::jsonrpc::{JsonRpcMessage, RequestId};
use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memchr;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SSE_RECONNECT_BASE: Duration = Duration::from_secs(1);
const SSE_RECONNECT_CAP: Duration = Duration::from_secs(10);
const NOTIFICATION_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = memchr(b'\n', &self.buffer[search_index..]) {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..line_end]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }

            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// MCP over HTTP POST with JSON, inline event-stream, or `202 Accepted`
/// plus an optional long-lived GET event stream.
pub type StreamableHttpSource = RemoteSource<HttpConnection>;

struct HttpShared {
    server_id: String,
    client: reqwest::Client,
    post_url: String,
    stream_url: String,
    headers: Vec<(String, String)>,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
}

impl HttpShared {
    fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn protocol_version(&self) -> Option<String> {
        self.protocol_version
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn capture_session(&self, response: &reqwest::Response) {
        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            let mut current = self
                .session_id
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if current.as_deref() != Some(session_id) {
                debug!(server_id = %self.server_id, session_id, "Captured MCP session id");
                *current = Some(session_id.to_string());
            }
        }
    }

    fn decorate(&self, mut request: reqwest::RequestBuilder, with_session: bool) -> reqwest::RequestBuilder {
        request = apply_streamable_http_protocol_version_header(
            request,
            self.protocol_version().as_deref(),
        );
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if with_session {
            if let Some(session_id) = self.session_id() {
                request = request.header(MCP_SESSION_ID_HEADER, session_id);
            }
        }
        request
    }

    fn post(&self, body: &Value, with_session: bool) -> reqwest::RequestBuilder {
        self.decorate(
            apply_streamable_http_client_post_headers(self.client.post(&self.post_url)),
            with_session,
        )
        .body(body.to_string())
    }

    async fn send_notification(&self, method: &str) -> Result<(), String> {
        let frame = JsonRpcMessage::notification(method, None).to_value();
        let response = self
            .post(&frame, true)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        self.capture_session(&response);
        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }
        if status.is_success() {
            debug!(server_id = %self.server_id, %status, "Notification acknowledged without 202");
            return Ok(());
        }
        Err(format!("HTTP error: {status}"))
    }
}

pub struct HttpConnection {
    shared: Arc<HttpShared>,
    to_endpoint: mpsc::UnboundedSender<Value>,
    cancel: CancellationToken,
    open_event_stream: bool,
}

impl StreamableHttpSource {
    pub fn connect(server: ResolvedServer) -> Self {
        let (endpoint_end, transport_end) = channel_pair();
        let endpoint = Endpoint::with_timeout(
            format!("sse:{}", server.id),
            endpoint_end,
            Some(server.request_timeout),
        );
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let shared = Arc::new(HttpShared {
            server_id: server.id.clone(),
            client,
            post_url: server.post_url.clone().unwrap_or_else(|| server.url.clone()),
            stream_url: server.url.clone(),
            headers: server.headers.clone(),
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(None),
        });

        let cancel = CancellationToken::new();
        let ChannelEnd { outbound, inbound } = transport_end;
        tokio::spawn(run_dispatch(
            shared.clone(),
            inbound,
            outbound.clone(),
            cancel.clone(),
        ));

        RemoteSource {
            protocol: RemoteProtocol::new(server.id.clone(), endpoint),
            hooks: HttpConnection {
                shared,
                to_endpoint: outbound,
                cancel,
                open_event_stream: server.open_event_stream,
            },
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.hooks.shared.session_id()
    }
}

#[async_trait]
impl SessionHooks for HttpConnection {
    async fn on_initialized(&self, _endpoint: &Endpoint, negotiated: &Negotiated) {
        if !negotiated.legacy {
            *self
                .shared
                .protocol_version
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(negotiated.protocol_version.clone());

            let ack = tokio::time::timeout(
                NOTIFICATION_ACK_TIMEOUT,
                self.shared.send_notification("notifications/initialized"),
            )
            .await;
            match ack {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(server_id = %self.shared.server_id, error = %err, "Initialized notification failed")
                }
                Err(_) => {
                    warn!(server_id = %self.shared.server_id, "Initialized notification was not acknowledged")
                }
            }
        }

        if self.open_event_stream {
            tokio::spawn(run_event_stream(
                self.shared.clone(),
                self.to_endpoint.clone(),
                self.cancel.clone(),
            ));
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let Some(session_id) = self.shared.session_id() else {
            return;
        };
        let request = self
            .shared
            .decorate(self.shared.client.delete(&self.shared.post_url), false)
            .header(MCP_SESSION_ID_HEADER, session_id);
        let _ = tokio::time::timeout(SESSION_CLOSE_TIMEOUT, request.send()).await;
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_dispatch(
    shared: Arc<HttpShared>,
    mut from_endpoint: mpsc::UnboundedReceiver<Value>,
    to_endpoint: mpsc::UnboundedSender<Value>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = from_endpoint.recv() => frame,
            _ = cancel.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        tokio::spawn(post_frame(shared.clone(), frame, to_endpoint.clone()));
    }
}

fn reject(to_endpoint: &mpsc::UnboundedSender<Value>, id: Option<&RequestId>, message: String) {
    if let Some(id) = id {
        let _ = to_endpoint.send(transport_failure(id.clone(), message));
    }
}

async fn post_frame(shared: Arc<HttpShared>, frame: Value, to_endpoint: mpsc::UnboundedSender<Value>) {
    let request_id = request_id_of(&frame);
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let is_initialize = method == "initialize" || method == "mcp.initialize";
    debug!(server_id = %shared.server_id, url = %shared.post_url, method = %method, "Sending MCP HTTP request");

    let response = match shared.post(&frame, !is_initialize).send().await {
        Ok(response) => response,
        Err(err) => {
            debug!(server_id = %shared.server_id, error = %err, "MCP HTTP request failed");
            reject(&to_endpoint, request_id.as_ref(), err.to_string());
            return;
        }
    };
    shared.capture_session(&response);

    let status = response.status();
    if status == StatusCode::ACCEPTED {
        // The reply, if any, arrives on the event stream.
        return;
    }
    if !status.is_success() {
        reject(&to_endpoint, request_id.as_ref(), format!("HTTP error: {status}"));
        return;
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if is_event_stream_content_type(&content_type) {
        match forward_event_stream(response, &to_endpoint, request_id.as_ref()).await {
            Ok(true) => {}
            Ok(false) => reject(
                &to_endpoint,
                request_id.as_ref(),
                "Empty event-stream response.".to_string(),
            ),
            Err(err) => reject(&to_endpoint, request_id.as_ref(), err),
        }
        return;
    }

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => {
            reject(&to_endpoint, request_id.as_ref(), err.to_string());
            return;
        }
    };
    let text = String::from_utf8_lossy(&body);
    if text.trim().is_empty() {
        return;
    }
    let messages = JsonRpcMessage::decode_frame(&text);
    if messages.is_empty() {
        reject(
            &to_endpoint,
            request_id.as_ref(),
            "Invalid JSON-RPC response body.".to_string(),
        );
        return;
    }
    for message in messages {
        let _ = to_endpoint.send(message.to_value());
    }
}

/// Forward every JSON-RPC message on an event stream to the endpoint.
/// With `wait_for`, stops once the response carrying that id has passed and
/// reports whether it was seen.
async fn forward_event_stream(
    response: reqwest::Response,
    to_endpoint: &mpsc::UnboundedSender<Value>,
    wait_for: Option<&RequestId>,
) -> Result<bool, String> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    let forward = |lines: Vec<String>| -> bool {
        for line in lines {
            let Some(payload) = sse_data_payload(&line) else {
                continue;
            };
            if payload.is_empty() {
                continue;
            }
            for message in JsonRpcMessage::decode_frame(payload) {
                let matched = matches!(
                    (&message, wait_for),
                    (JsonRpcMessage::Response { id, .. }, Some(expected)) if id == expected
                );
                let _ = to_endpoint.send(message.to_value());
                if matched {
                    return true;
                }
            }
        }
        false
    };

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        if forward(buffer.push(&chunk)) {
            return Ok(true);
        }
    }
    Ok(forward(buffer.finish()))
}

enum StreamOutcome {
    Ended,
    Unsupported,
    Failed(String),
}

async fn open_event_stream(
    shared: &HttpShared,
    to_endpoint: &mpsc::UnboundedSender<Value>,
) -> StreamOutcome {
    let request = shared.decorate(
        shared
            .client
            .get(&shared.stream_url)
            .header("Accept", "text/event-stream"),
        true,
    );
    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => return StreamOutcome::Failed(err.to_string()),
    };
    shared.capture_session(&response);

    if response.status() == StatusCode::METHOD_NOT_ALLOWED {
        return StreamOutcome::Unsupported;
    }
    if !response.status().is_success() {
        return StreamOutcome::Failed(format!("HTTP error: {}", response.status()));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !is_event_stream_content_type(content_type) {
        return StreamOutcome::Unsupported;
    }

    match forward_event_stream(response, to_endpoint, None).await {
        Ok(_) => StreamOutcome::Ended,
        Err(err) => StreamOutcome::Failed(err),
    }
}

async fn run_event_stream(
    shared: Arc<HttpShared>,
    to_endpoint: mpsc::UnboundedSender<Value>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(SSE_RECONNECT_BASE, SSE_RECONNECT_CAP);

    loop {
        let outcome = tokio::select! {
            outcome = open_event_stream(&shared, &to_endpoint) => outcome,
            _ = cancel.cancelled() => break,
        };
        match outcome {
            StreamOutcome::Unsupported => {
                debug!(server_id = %shared.server_id, "Server does not offer an event stream");
                break;
            }
            StreamOutcome::Ended => {
                debug!(server_id = %shared.server_id, "Event stream ended");
                backoff.reset();
            }
            StreamOutcome::Failed(err) => {
                debug!(server_id = %shared.server_id, error = %err, "Event stream failed");
            }
        }

        let delay = backoff.next_delay();
        debug!(server_id = %shared.server_id, delay_ms = delay.as_millis() as u64, "Scheduling event stream reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests;
