use super::*;
use crate::mcp::jsonrpc::{CONNECTION_CLOSED, REQUEST_TIMEOUT};
use crate::mcp::transport::test_support::{HttpRequest, HttpResponse, Responder, TestHttpServer};
use crate::mcp::McpSource;
use futures_util::future::BoxFuture;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};

fn responder<F>(handler: F) -> Responder
where
    F: Fn(HttpRequest) -> HttpResponse + Send + Sync + 'static,
{
    Arc::new(move |request: HttpRequest| -> BoxFuture<'static, HttpResponse> {
        let response = handler(request);
        Box::pin(async move { response })
    })
}

fn rpc_result(request: &HttpRequest, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": request.json()["id"], "result": result})
}

fn modern_server(request: HttpRequest) -> HttpResponse {
    match request.rpc_method().as_str() {
        "initialize" => HttpResponse::json(rpc_result(
            &request,
            json!({"protocolVersion": "2025-06-18", "capabilities": {"tools": {}}}),
        ))
        .with_header("Mcp-Session-Id", "sess-1"),
        "notifications/initialized" => HttpResponse::status(202),
        "tools/list" => HttpResponse::json(rpc_result(
            &request,
            json!({"tools": [{"name": "search", "description": "Search", "inputSchema": {}}]}),
        )),
        "resources/list" => HttpResponse::event_stream(&[
            json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {"progress": 1}}),
            rpc_result(
                &request,
                json!({"resources": [{"uri": "docs://readme", "name": "readme"}]}),
            ),
        ]),
        "tools/call" => HttpResponse::status(202),
        "" => HttpResponse::status(405),
        method => HttpResponse::json(json!({
            "jsonrpc": "2.0",
            "id": request.json()["id"],
            "error": {"code": -32601, "message": format!("Method '{method}' not found")}
        })),
    }
}

fn server_config(url: &str, timeout: Duration, open_event_stream: bool) -> ResolvedServer {
    ResolvedServer {
        id: "remote".to_string(),
        url: url.to_string(),
        post_url: None,
        headers: vec![("X-Client".to_string(), "palaver".to_string())],
        protocols: Vec::new(),
        request_timeout: timeout,
        open_event_stream,
    }
}

#[tokio::test]
async fn json_and_inline_stream_replies_carry_session() {
    let server = TestHttpServer::start(responder(modern_server)).await;
    let source =
        StreamableHttpSource::connect(server_config(&server.url, Duration::from_secs(5), false));

    let tools = source.load_tools().await.expect("tools");
    assert_eq!(tools[0].name, "search");
    let resources = source.load_resources().await.expect("resources");
    assert_eq!(resources[0].uri, "docs://readme");
    assert_eq!(source.session_id().as_deref(), Some("sess-1"));

    let requests = server.requests();
    let methods: Vec<String> = requests.iter().map(HttpRequest::rpc_method).collect();
    assert_eq!(
        methods,
        vec!["initialize", "notifications/initialized", "tools/list", "resources/list"]
    );

    let initialize = &requests[0];
    assert_eq!(initialize.header("mcp-session-id"), None);
    assert_eq!(
        initialize.header("accept"),
        Some("application/json, text/event-stream")
    );
    assert_eq!(initialize.header("x-client"), Some("palaver"));

    for request in &requests[1..] {
        assert_eq!(request.header("mcp-session-id"), Some("sess-1"));
        assert_eq!(request.header("mcp-protocol-version"), Some("2025-06-18"));
    }
}

#[tokio::test]
async fn accepted_request_resolves_from_event_stream() {
    let (call_tx, call_rx) = tokio::sync::watch::channel::<Option<Value>>(None);
    let call_tx = Arc::new(call_tx);
    let streamed = Arc::new(AtomicBool::new(false));

    let handler: Responder = Arc::new(move |request: HttpRequest| -> BoxFuture<'static, HttpResponse> {
        let call_tx = call_tx.clone();
        let mut call_rx = call_rx.clone();
        let streamed = streamed.clone();
        Box::pin(async move {
            if request.method == "GET" {
                if streamed.swap(true, Ordering::SeqCst) {
                    return HttpResponse::status(405);
                }
                let Ok(id) = call_rx.wait_for(Option::is_some).await.map(|id| id.clone()) else {
                    return HttpResponse::status(500);
                };
                return HttpResponse::event_stream(&[json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"content": [{"type": "text", "text": "from stream"}]}
                })]);
            }
            if request.rpc_method() == "tools/call" {
                let _ = call_tx.send(Some(request.json()["id"].clone()));
                return HttpResponse::status(202);
            }
            modern_server(request)
        })
    });

    let server = TestHttpServer::start(handler).await;
    let source =
        StreamableHttpSource::connect(server_config(&server.url, Duration::from_secs(5), true));

    let result = source
        .call_tool("search", json!({"q": "x"}))
        .await
        .expect("call");
    assert_eq!(result["content"][0]["text"], json!("from stream"));

    let get = server
        .requests()
        .into_iter()
        .find(|request| request.method == "GET")
        .expect("event stream request");
    assert_eq!(get.header("accept"), Some("text/event-stream"));
    assert_eq!(get.header("mcp-session-id"), Some("sess-1"));
    source.disconnect().await;
}

#[tokio::test]
async fn request_without_reply_times_out() {
    let server = TestHttpServer::start(responder(modern_server)).await;
    let source = StreamableHttpSource::connect(server_config(
        &server.url,
        Duration::from_millis(300),
        false,
    ));
    source.initialize().await.expect("initialize");

    let err = source
        .call_tool("search", json!({}))
        .await
        .expect_err("timeout");
    assert_eq!(err.code, REQUEST_TIMEOUT);
}

#[tokio::test]
async fn http_errors_reject_the_request() {
    let server = TestHttpServer::start(responder(|_| HttpResponse::status(500))).await;
    let source =
        StreamableHttpSource::connect(server_config(&server.url, Duration::from_secs(5), false));

    let err = source.initialize().await.expect_err("http error");
    assert_eq!(err.code, CONNECTION_CLOSED);
    assert!(err.message.contains("HTTP error: 500"), "{}", err.message);
}

#[tokio::test]
async fn unreachable_server_fails_fast() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let url = format!("http://{}/mcp", listener.local_addr().expect("addr"));
    drop(listener);

    let source = StreamableHttpSource::connect(server_config(&url, Duration::from_secs(30), false));
    let started = std::time::Instant::now();
    let err = source.load_tools().await.expect_err("refused");
    assert_eq!(err.code, CONNECTION_CLOSED);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn disconnect_closes_the_session() {
    let server = TestHttpServer::start(responder(|request| {
        if request.method == "DELETE" {
            return HttpResponse::status(200);
        }
        modern_server(request)
    }))
    .await;
    let source =
        StreamableHttpSource::connect(server_config(&server.url, Duration::from_secs(5), false));
    source.initialize().await.expect("initialize");
    source.disconnect().await;

    let delete = server
        .requests()
        .into_iter()
        .find(|request| request.method == "DELETE")
        .expect("delete");
    assert_eq!(delete.header("mcp-session-id"), Some("sess-1"));
    assert!(source.load_tools().await.is_err());
}

#[test]
fn sse_buffer_handles_partial_and_crlf_lines() {
    let mut buffer = SseLineBuffer::default();
    assert!(buffer.push(b"data: one").is_empty());
    assert_eq!(buffer.push(b"\r\n\r\ndata: tw"), vec!["data: one"]);
    assert_eq!(buffer.finish(), vec!["data: tw"]);
}

#[test]
fn detects_event_stream_content_type() {
    assert!(is_event_stream_content_type(
        "text/event-stream; charset=utf-8"
    ));
    assert!(!is_event_stream_content_type("application/json"));
    assert_eq!(sse_data_payload("data: {\"id\":1}"), Some("{\"id\":1}"));
    assert_eq!(sse_data_payload("event: ping"), None);
}
