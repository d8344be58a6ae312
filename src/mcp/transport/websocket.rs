use super::{
    request_id_of, transport_failure, Backoff, Negotiated, RemoteProtocol, RemoteSource,
    ResolvedServer, SessionHooks,
};
use crate::mcp::endpoint::{channel_pair, ChannelEnd, Endpoint};
use crate::mcp::jsonrpc::{JsonRpcMessage, RequestId};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WS_RECONNECT_BASE: Duration = Duration::from_millis(500);
const WS_RECONNECT_CAP: Duration = Duration::from_secs(8);
const WS_REPLAY_TIMEOUT: Duration = Duration::from_secs(10);
const REPLAY_ID: &str = "reconnect-initialize";

/// MCP over a single WebSocket, reconnecting with backoff until
/// `disconnect()`.
pub type WebSocketSource = RemoteSource<WebSocketConnection>;

pub struct WebSocketConnection {
    server_id: String,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
}

impl WebSocketSource {
    /// Start the connection task. Requests issued before the socket opens
    /// wait in the endpoint's channel and are flushed once it does.
    pub fn connect(server: ResolvedServer) -> Self {
        let (endpoint_end, transport_end) = channel_pair();
        let endpoint = Endpoint::with_timeout(
            format!("ws:{}", server.id),
            endpoint_end,
            Some(server.request_timeout),
        );
        let cancel = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_connection(
            server.clone(),
            transport_end,
            cancel.clone(),
            connected.clone(),
        ));

        RemoteSource {
            protocol: RemoteProtocol::new(server.id.clone(), endpoint),
            hooks: WebSocketConnection {
                server_id: server.id,
                cancel,
                connected,
            },
        }
    }

    pub fn is_connected(&self) -> bool {
        self.hooks.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHooks for WebSocketConnection {
    async fn on_initialized(&self, endpoint: &Endpoint, negotiated: &Negotiated) {
        if negotiated.legacy {
            return;
        }
        if let Err(err) = endpoint.notify("notifications/initialized", None) {
            warn!(server_id = %self.server_id, error = %err, "Failed to send initialized notification");
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn build_request(server: &ResolvedServer) -> Result<Request, String> {
    let mut request = server
        .url
        .as_str()
        .into_client_request()
        .map_err(|err| err.to_string())?;
    let headers = request.headers_mut();
    for (name, value) in &server.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| err.to_string())?;
        let value = HeaderValue::from_str(value).map_err(|err| err.to_string())?;
        headers.insert(name, value);
    }
    if !server.protocols.is_empty() {
        let value =
            HeaderValue::from_str(&server.protocols.join(", ")).map_err(|err| err.to_string())?;
        headers.insert("Sec-WebSocket-Protocol", value);
    }
    Ok(request)
}

/// The handshake the session completed, kept so a fresh socket can be
/// brought to the same state before queued requests reach the server.
#[derive(Default)]
struct Handshake {
    pending: Option<(RequestId, Value)>,
    initialize: Option<Value>,
    initialized: Option<Value>,
}

impl Handshake {
    fn observe_outgoing(&mut self, frame: &Value) {
        match frame.get("method").and_then(Value::as_str) {
            Some("initialize" | "mcp.initialize") => {
                if let Some(id) = request_id_of(frame) {
                    self.pending = Some((id, frame.clone()));
                }
            }
            Some("notifications/initialized") => self.initialized = Some(frame.clone()),
            _ => {}
        }
    }

    fn observe_response(&mut self, id: &RequestId, succeeded: bool) {
        if self.pending.as_ref().is_some_and(|(pending, _)| pending == id) {
            if let Some((_, frame)) = self.pending.take() {
                if succeeded {
                    self.initialize = Some(frame);
                }
            }
        }
    }

    /// The recorded `initialize` under an id the endpoint never issued.
    fn replay_request(&self) -> Option<Value> {
        let mut frame = self.initialize.clone()?;
        frame["id"] = Value::String(REPLAY_ID.to_string());
        Some(frame)
    }
}

enum PumpExit {
    Closed,
    Cancelled,
    EndpointGone,
}

async fn run_connection(
    server: ResolvedServer,
    mut channel: ChannelEnd,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = Backoff::new(WS_RECONNECT_BASE, WS_RECONNECT_CAP);
    // A frame dequeued while the socket was going down.
    let mut carry: Option<Value> = None;
    let mut handshake = Handshake::default();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let request = match build_request(&server) {
            Ok(request) => request,
            Err(err) => {
                warn!(server_id = %server.id, error = %err, "Invalid WebSocket request");
                break;
            }
        };

        let attempt = tokio::select! {
            attempt = tokio_tungstenite::connect_async(request) => attempt,
            _ = cancel.cancelled() => break,
        };

        match attempt {
            Ok((socket, _response)) => {
                info!(server_id = %server.id, url = %server.url, "WebSocket connected");
                backoff.reset();
                connected.store(true, Ordering::SeqCst);
                let exit = pump(
                    &server.id,
                    socket,
                    &mut channel,
                    &cancel,
                    &mut carry,
                    &mut handshake,
                )
                .await;
                connected.store(false, Ordering::SeqCst);
                match exit {
                    PumpExit::Closed => {}
                    PumpExit::Cancelled | PumpExit::EndpointGone => break,
                }
            }
            Err(err) => {
                debug!(server_id = %server.id, error = %err, "WebSocket connection failed");
            }
        }

        let delay = backoff.next_delay();
        debug!(server_id = %server.id, delay_ms = delay.as_millis() as u64, "Scheduling WebSocket reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
    }

    debug!(server_id = %server.id, "WebSocket connection loop stopped");
}

async fn pump<S>(
    server_id: &str,
    socket: tokio_tungstenite::WebSocketStream<S>,
    channel: &mut ChannelEnd,
    cancel: &CancellationToken,
    carry: &mut Option<Value>,
    handshake: &mut Handshake,
) -> PumpExit
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let mut in_flight: HashSet<RequestId> = HashSet::new();

    // A reconnected socket is a new session on the server side.
    if let Some(request) = handshake.replay_request() {
        debug!(server_id = %server_id, "Repeating handshake on reconnected socket");
        if sink.send(Message::Text(request.to_string())).await.is_err() {
            return PumpExit::Closed;
        }
        let replayed = tokio::time::timeout(WS_REPLAY_TIMEOUT, async {
            while let Some(incoming) = stream.next().await {
                let text = match incoming {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => return false,
                    Ok(_) => continue,
                };
                for message in JsonRpcMessage::decode_frame(&text) {
                    match message {
                        JsonRpcMessage::Response { id, outcome }
                            if id == RequestId::String(REPLAY_ID.to_string()) =>
                        {
                            return outcome.is_ok();
                        }
                        other => {
                            let _ = channel.outbound.send(other.to_value());
                        }
                    }
                }
            }
            false
        });
        let replayed = tokio::select! {
            replayed = replayed => replayed.unwrap_or(false),
            _ = cancel.cancelled() => return PumpExit::Cancelled,
        };
        if !replayed {
            warn!(server_id = %server_id, "Server rejected the repeated handshake");
            return PumpExit::Closed;
        }
        if let Some(notification) = &handshake.initialized {
            if sink.send(Message::Text(notification.to_string())).await.is_err() {
                return PumpExit::Closed;
            }
        }
    }

    if let Some(frame) = carry.take() {
        handshake.observe_outgoing(&frame);
        let id = request_id_of(&frame);
        if sink.send(Message::Text(frame.to_string())).await.is_err() {
            *carry = Some(frame);
            return PumpExit::Closed;
        }
        in_flight.extend(id);
    }

    let exit = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break PumpExit::Cancelled;
            }
            frame = channel.inbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(Message::Close(None)).await;
                    break PumpExit::EndpointGone;
                };
                handshake.observe_outgoing(&frame);
                let id = request_id_of(&frame);
                if sink.send(Message::Text(frame.to_string())).await.is_err() {
                    *carry = Some(frame);
                    break PumpExit::Closed;
                }
                in_flight.extend(id);
            }
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_))) | None => break PumpExit::Closed,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(server_id = %server_id, error = %err, "WebSocket read failed");
                        break PumpExit::Closed;
                    }
                };
                for message in JsonRpcMessage::decode_frame(&text) {
                    if let JsonRpcMessage::Response { id, outcome } = &message {
                        handshake.observe_response(id, outcome.is_ok());
                        in_flight.remove(id);
                    }
                    let _ = channel.outbound.send(message.to_value());
                }
            }
        }
    };

    if matches!(exit, PumpExit::Closed) {
        info!(server_id = %server_id, in_flight = in_flight.len(), "WebSocket closed");
        for id in in_flight {
            let _ = channel
                .outbound
                .send(transport_failure(id, "WebSocket connection closed"));
        }
    }
    exit
}
