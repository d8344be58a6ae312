//! Transport-agnostic JSON-RPC endpoint.
//!
//! An [`Endpoint`] owns one end of a frame channel. It correlates outgoing
//! requests with their responses through a [`PendingRequests`] table and
//! dispatches incoming requests to registered handlers. The transports in
//! [`crate::mcp::transport`] bridge the other end of the channel to a
//! socket or HTTP stream.

use crate::mcp::jsonrpc::{JsonRpcMessage, RequestId, RpcError};
use crate::utils::ids::generate_id;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type HandlerFuture = BoxFuture<'static, Result<Value, RpcError>>;
type Handler = Arc<dyn Fn(Option<Value>) -> HandlerFuture + Send + Sync>;
type Outcome = Result<Value, RpcError>;

/// One side of a bidirectional frame channel.
pub struct ChannelEnd {
    pub outbound: mpsc::UnboundedSender<Value>,
    pub inbound: mpsc::UnboundedReceiver<Value>,
}

/// Two connected ends: each receives exactly what the other sends.
pub fn channel_pair() -> (ChannelEnd, ChannelEnd) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    (
        ChannelEnd {
            outbound: left_tx,
            inbound: left_rx,
        },
        ChannelEnd {
            outbound: right_tx,
            inbound: right_rx,
        },
    )
}

/// Outstanding requests keyed by id. Each entry is settled at most once.
#[derive(Clone, Default)]
pub struct PendingRequests {
    entries: Arc<Mutex<HashMap<RequestId, oneshot::Sender<Outcome>>>>,
}

impl PendingRequests {
    pub async fn register(&self, id: RequestId) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().await.insert(id, tx);
        rx
    }

    /// Settle the entry for `id`. Returns `false` when nothing was waiting.
    pub async fn resolve(&self, id: &RequestId, outcome: Outcome) -> bool {
        match self.entries.lock().await.remove(id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &RequestId) -> bool {
        self.entries.lock().await.remove(id).is_some()
    }

    pub async fn reject_all(&self, error: RpcError) -> usize {
        let drained: Vec<_> = self.entries.lock().await.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

struct EndpointInner {
    label: String,
    outbound: mpsc::UnboundedSender<Value>,
    pending: PendingRequests,
    handlers: RwLock<HashMap<String, Handler>>,
    closed: CancellationToken,
    request_timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Take ownership of `channel` and start the reader task. Must be called
    /// inside a Tokio runtime.
    pub fn new(label: impl Into<String>, channel: ChannelEnd) -> Self {
        Self::with_timeout(label, channel, None)
    }

    pub fn with_timeout(
        label: impl Into<String>,
        channel: ChannelEnd,
        request_timeout: Option<Duration>,
    ) -> Self {
        let ChannelEnd { outbound, inbound } = channel;
        let inner = Arc::new(EndpointInner {
            label: label.into(),
            outbound,
            pending: PendingRequests::default(),
            handlers: RwLock::new(HashMap::new()),
            closed: CancellationToken::new(),
            request_timeout,
        });
        spawn_reader(Arc::downgrade(&inner), inner.closed.clone(), inbound);
        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Register (or replace) the handler for `method`.
    pub fn on_request<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| Box::pin(handler(params)));
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), handler);
    }

    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.send_request_with_timeout(method, params, self.inner.request_timeout)
            .await
    }

    /// Send a request and wait for its response, or until `timeout` elapses.
    /// A response that arrives after the timeout finds no pending entry and
    /// is dropped.
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::disconnected());
        }

        let id = RequestId::String(generate_id());
        let rx = self.inner.pending.register(id.clone()).await;
        let frame = JsonRpcMessage::request(id.clone(), method, params).to_value();
        if self.inner.outbound.send(frame).is_err() {
            self.inner.pending.remove(&id).await;
            return Err(RpcError::disconnected());
        }
        debug!(endpoint = %self.inner.label, method, request_id = %id, "Sent request");

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.inner.pending.remove(&id).await;
                    debug!(endpoint = %self.inner.label, method, request_id = %id, "Request timed out");
                    return Err(RpcError::timeout(method));
                }
            },
            None => rx.await,
        };

        received.unwrap_or_else(|_| Err(RpcError::disconnected()))
    }

    /// Fire-and-forget message with no id.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.send(&JsonRpcMessage::notification(method, params))
    }

    pub fn send(&self, message: &JsonRpcMessage) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::disconnected());
        }
        self.inner
            .outbound
            .send(message.to_value())
            .map_err(|_| RpcError::disconnected())
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.len().await
    }

    /// Stop reading and reject everything still outstanding.
    pub async fn close(&self) {
        self.inner.closed.cancel();
        let rejected = self.inner.pending.reject_all(RpcError::disconnected()).await;
        if rejected > 0 {
            debug!(endpoint = %self.inner.label, rejected, "Rejected pending requests on close");
        }
    }
}

fn spawn_reader(
    inner: Weak<EndpointInner>,
    closed: CancellationToken,
    mut inbound: mpsc::UnboundedReceiver<Value>,
) {
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = inbound.recv() => frame,
                _ = closed.cancelled() => None,
            };
            let Some(frame) = frame else {
                break;
            };
            let Some(inner) = inner.upgrade() else {
                break;
            };

            let messages: Vec<JsonRpcMessage> = match frame {
                Value::Array(items) => items.into_iter().filter_map(JsonRpcMessage::decode).collect(),
                other => JsonRpcMessage::decode(other).into_iter().collect(),
            };
            if messages.is_empty() {
                debug!(endpoint = %inner.label, "Dropping malformed frame");
            }
            for message in messages {
                dispatch(&inner, message).await;
            }
        }

        if let Some(inner) = inner.upgrade() {
            inner.pending.reject_all(RpcError::disconnected()).await;
        }
    });
}

async fn dispatch(inner: &Arc<EndpointInner>, message: JsonRpcMessage) {
    match message {
        JsonRpcMessage::Response { id, outcome } => {
            if !inner.pending.resolve(&id, outcome).await {
                debug!(endpoint = %inner.label, response_id = %id, "Dropping unmatched response");
            }
        }
        JsonRpcMessage::Request { id, method, params } => {
            handle_request(inner, Some(id), method, params);
        }
        JsonRpcMessage::Notification { method, params } => {
            handle_request(inner, None, method, params);
        }
    }
}

fn handle_request(
    inner: &Arc<EndpointInner>,
    id: Option<RequestId>,
    method: String,
    params: Option<Value>,
) {
    let handler = inner
        .handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&method)
        .cloned();

    let Some(handler) = handler else {
        match id {
            Some(id) => {
                debug!(endpoint = %inner.label, method = %method, "No handler for request");
                let reply =
                    JsonRpcMessage::response(id, Err(RpcError::method_not_found(&method)));
                let _ = inner.outbound.send(reply.to_value());
            }
            None => debug!(endpoint = %inner.label, method = %method, "Ignoring notification"),
        }
        return;
    };

    let outbound = inner.outbound.clone();
    let label = inner.label.clone();
    let work = handler(params);
    tokio::spawn(async move {
        // A panicking handler surfaces as a JoinError instead of tearing
        // down the reader.
        let outcome = match tokio::spawn(work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::internal(format!(
                "Handler for '{method}' failed unexpectedly"
            ))),
        };

        match id {
            Some(id) => {
                if let Err(err) = &outcome {
                    debug!(endpoint = %label, method = %method, error = %err, "Request handler failed");
                }
                let _ = outbound.send(JsonRpcMessage::response(id, outcome).to_value());
            }
            None => {
                if let Err(err) = outcome {
                    warn!(endpoint = %label, method = %method, error = %err, "Notification handler failed");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn next_request(end: &mut ChannelEnd) -> (RequestId, String, Option<Value>) {
        let frame = end.inbound.recv().await.expect("frame");
        match JsonRpcMessage::decode(frame) {
            Some(JsonRpcMessage::Request { id, method, params }) => (id, method, params),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_by_id_out_of_order() {
        let (local, mut remote) = channel_pair();
        let endpoint = Endpoint::new("test", local);

        let first = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.send_request("echo", Some(json!(1))).await }
        });
        let second = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.send_request("echo", Some(json!(2))).await }
        });

        let a = next_request(&mut remote).await;
        let b = next_request(&mut remote).await;

        // Answer in reverse order, echoing each request's params.
        for (id, _, params) in [b, a] {
            let reply = JsonRpcMessage::response(id, Ok(params.unwrap_or(Value::Null)));
            remote.outbound.send(reply.to_value()).expect("send");
        }

        assert_eq!(first.await.expect("join").expect("first"), json!(1));
        assert_eq!(second.await.expect("join").expect("second"), json!(2));
        assert_eq!(endpoint.pending_count().await, 0);
    }

    #[tokio::test]
    async fn error_responses_reject_with_code_prefix() {
        let (local, mut remote) = channel_pair();
        let endpoint = Endpoint::new("test", local);

        let call = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.send_request("tools/call", None).await }
        });
        let (id, _, _) = next_request(&mut remote).await;
        let error = RpcError::execution_failed("boom").with_data(json!({"detail": 1}));
        remote
            .outbound
            .send(JsonRpcMessage::response(id, Err(error)).to_value())
            .expect("send");

        let err = call.await.expect("join").expect_err("error");
        assert_eq!(err.to_string(), "[5001] Tool execution failed: boom");
        assert_eq!(err.data, Some(json!({"detail": 1})));
    }

    #[tokio::test]
    async fn unknown_method_gets_error_only_for_requests() {
        let (local, mut remote) = channel_pair();
        let _endpoint = Endpoint::new("server", local);

        remote
            .outbound
            .send(json!({"jsonrpc": "2.0", "method": "nope"}))
            .expect("send");
        remote
            .outbound
            .send(json!({"jsonrpc": "2.0", "id": 3, "method": "nope"}))
            .expect("send");

        let reply = remote.inbound.recv().await.expect("reply");
        assert_eq!(
            reply,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "error": {"code": -32601, "message": "Method 'nope' not found"}
            })
        );
        assert!(remote.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn handler_results_and_failures_become_replies() {
        let (local, mut remote) = channel_pair();
        let endpoint = Endpoint::new("server", local);
        endpoint.on_request("add", |params| async move {
            let params = params.unwrap_or_default();
            let a = params["a"].as_i64().unwrap_or(0);
            let b = params["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });
        endpoint.on_request("fail", |_| async move {
            Err(RpcError::server_error("bad input"))
        });
        endpoint.on_request("panic", |_| async move {
            if true {
                panic!("handler bug");
            }
            Ok(Value::Null)
        });

        remote
            .outbound
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "add", "params": {"a": 2, "b": 3}}))
            .expect("send");
        let reply = remote.inbound.recv().await.expect("reply");
        assert_eq!(reply["result"], json!(5));

        remote
            .outbound
            .send(json!({"jsonrpc": "2.0", "id": 2, "method": "fail"}))
            .expect("send");
        let reply = remote.inbound.recv().await.expect("reply");
        assert_eq!(reply["error"]["code"], json!(-32000));
        assert_eq!(reply["error"]["message"], json!("bad input"));

        remote
            .outbound
            .send(json!({"jsonrpc": "2.0", "id": 3, "method": "panic"}))
            .expect("send");
        let reply = remote.inbound.recv().await.expect("reply");
        assert_eq!(reply["error"]["code"], json!(-32603));

        // The endpoint keeps serving after a handler panic.
        remote
            .outbound
            .send(json!({"jsonrpc": "2.0", "id": 4, "method": "add", "params": {"a": 1, "b": 1}}))
            .expect("send");
        let reply = remote.inbound.recv().await.expect("reply");
        assert_eq!(reply["result"], json!(2));
    }

    #[tokio::test]
    async fn unmatched_and_malformed_frames_are_dropped() {
        let (local, mut remote) = channel_pair();
        let endpoint = Endpoint::new("test", local);

        remote
            .outbound
            .send(json!({"jsonrpc": "2.0", "id": "stray", "result": 1}))
            .expect("send");
        remote.outbound.send(json!("garbage")).expect("send");

        let call = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.send_request("ping", None).await }
        });
        let (id, method, _) = next_request(&mut remote).await;
        assert_eq!(method, "ping");
        remote
            .outbound
            .send(JsonRpcMessage::response(id, Ok(json!({}))).to_value())
            .expect("send");
        assert_eq!(call.await.expect("join").expect("ping"), json!({}));
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry() {
        let (local, mut remote) = channel_pair();
        let endpoint = Endpoint::new("test", local);

        let err = endpoint
            .send_request_with_timeout("slow", None, Some(Duration::from_millis(20)))
            .await
            .expect_err("timeout");
        assert_eq!(err.code, crate::mcp::jsonrpc::REQUEST_TIMEOUT);
        assert_eq!(endpoint.pending_count().await, 0);

        // A late reply is inert.
        let (id, _, _) = next_request(&mut remote).await;
        remote
            .outbound
            .send(JsonRpcMessage::response(id, Ok(json!(1))).to_value())
            .expect("send");
        tokio::task::yield_now().await;
        assert_eq!(endpoint.pending_count().await, 0);
    }

    #[tokio::test]
    async fn close_rejects_outstanding_requests() {
        let (local, _remote) = channel_pair();
        let endpoint = Endpoint::new("test", local);

        let call = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.send_request("never", None).await }
        });
        while endpoint.pending_count().await == 0 {
            tokio::task::yield_now().await;
        }
        endpoint.close().await;

        let err = call.await.expect("join").expect_err("disconnected");
        assert_eq!(err, RpcError::disconnected());
        assert!(endpoint.send_request("after", None).await.is_err());
    }
}
