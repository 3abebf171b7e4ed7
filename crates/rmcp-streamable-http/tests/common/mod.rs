#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use http::{Method, Request, header};
use http_body_util::BodyExt;
use rmcp_streamable_http::{
    Dispatcher, ErrorData, Peer, serve_transport,
    model::{InboundMessage, JsonRpcMessage},
    transport::{
        BoxResponse, SessionTransport, SessionTransportConfig,
        common::{http_header::HEADER_SESSION_ID, server_side_http::BoxResponseBody},
    },
};
use serde_json::{Value, json};
use tokio::sync::Notify;

pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// A small tools server.
///
/// * `tools/list` lists `echo` and `sum`
/// * `tools/call` runs a tool; `delay_ms` postpones the answer
/// * `broadcast` answers, then notifies on the standalone stream once
///   `trigger` is notified
/// * anything else is answered with method-not-found
#[derive(Debug, Clone, Default)]
pub struct ToolsDispatcher {
    pub trigger: Arc<Notify>,
    pub notifications: Arc<AtomicUsize>,
}

impl ToolsDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications_seen(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }

    fn call_tool(params: &Value) -> Result<Value, ErrorData> {
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        match params.get("name").and_then(Value::as_str) {
            Some("echo") => Ok(json!({ "content": [{ "type": "text", "text": arguments.to_string() }] })),
            Some("sum") => {
                let a = arguments.get("a").and_then(Value::as_i64).unwrap_or_default();
                let b = arguments.get("b").and_then(Value::as_i64).unwrap_or_default();
                Ok(json!({ "content": [{ "type": "text", "text": (a + b).to_string() }] }))
            }
            other => Err(ErrorData::invalid_params(
                format!("unknown tool {other:?}"),
                None,
            )),
        }
    }
}

impl Dispatcher for ToolsDispatcher {
    async fn dispatch(&self, message: InboundMessage, peer: Peer) {
        let request = match message.message {
            JsonRpcMessage::Request(request) => request,
            JsonRpcMessage::Notification(_) => {
                self.notifications.fetch_add(1, Ordering::SeqCst);
                return;
            }
            _ => return,
        };
        let params = request.params.clone().unwrap_or(Value::Null);
        let result = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": params.get("protocolVersion").cloned().unwrap_or(json!(LATEST_PROTOCOL_VERSION)),
                "capabilities": { "tools": { "listChanged": true } },
                "serverInfo": { "name": "tools-server", "version": "1.0.0" },
            })),
            "tools/list" => Ok(json!({
                "tools": [
                    { "name": "echo", "inputSchema": { "type": "object" } },
                    { "name": "sum", "inputSchema": { "type": "object" } },
                ]
            })),
            "tools/call" => {
                if let Some(delay) = params.get("delay_ms").and_then(Value::as_u64) {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Self::call_tool(&params)
            }
            "broadcast" => {
                let trigger = self.trigger.clone();
                let notifier = peer.clone();
                tokio::spawn(async move {
                    trigger.notified().await;
                    let _ = notifier
                        .notify("notifications/tools/list_changed", None)
                        .await;
                });
                Ok(json!({}))
            }
            method => Err(ErrorData::method_not_found(method)),
        };
        let outcome = match result {
            Ok(result) => peer.respond(request.id, result).await,
            Err(error) => peer.respond_error(request.id, error).await,
        };
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "failed to answer request");
        }
    }
}

/// A started transport served by a fresh [`ToolsDispatcher`].
pub async fn serve(config: SessionTransportConfig) -> (Arc<SessionTransport>, ToolsDispatcher) {
    let dispatcher = ToolsDispatcher::new();
    let (transport, inbound) = SessionTransport::new(config);
    serve_transport(Arc::new(dispatcher.clone()), transport.clone(), inbound)
        .await
        .expect("start transport");
    (transport, dispatcher)
}

pub fn init_request(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "test-client", "version": "1.0.0" }
        }
    })
}

pub fn request(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

pub fn notification(method: &str) -> Value {
    json!({ "jsonrpc": "2.0", "method": method })
}

pub fn post(body: &Value, session_id: Option<&str>) -> Request<Bytes> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .header(header::ACCEPT, "application/json, text/event-stream")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(session_id) = session_id {
        builder = builder.header(HEADER_SESSION_ID, session_id);
    }
    builder
        .body(Bytes::from(body.to_string()))
        .expect("valid request")
}

pub fn get(session_id: Option<&str>, last_event_id: Option<&str>) -> Request<Bytes> {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri("/mcp")
        .header(header::ACCEPT, "text/event-stream");
    if let Some(session_id) = session_id {
        builder = builder.header(HEADER_SESSION_ID, session_id);
    }
    if let Some(last_event_id) = last_event_id {
        builder = builder.header("Last-Event-Id", last_event_id);
    }
    builder.body(Bytes::new()).expect("valid request")
}

pub fn delete(session_id: &str) -> Request<Bytes> {
    Request::builder()
        .method(Method::DELETE)
        .uri("/mcp")
        .header(HEADER_SESSION_ID, session_id)
        .body(Bytes::new())
        .expect("valid request")
}

pub fn session_header(response: &BoxResponse) -> Option<String> {
    response
        .headers()
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

pub async fn body_json(response: BoxResponse) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("infallible body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn body_text(response: BoxResponse) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("infallible body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub data: Value,
}

/// Parse every event of a complete SSE body, skipping comments.
pub fn parse_sse(text: &str) -> Vec<SseEvent> {
    text.split("\n\n").filter_map(parse_block).collect()
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut id = None;
    let mut data = None;
    for line in block.lines() {
        if let Some(value) = line.strip_prefix("id: ") {
            id = Some(value.to_owned());
        } else if let Some(value) = line.strip_prefix("data: ") {
            data = serde_json::from_str(value).ok();
        }
    }
    Some(SseEvent { id, data: data? })
}

/// Reads events from a live SSE body one at a time.
pub struct SseReader {
    body: BoxResponseBody,
    buffer: String,
}

impl SseReader {
    pub fn new(response: BoxResponse) -> Self {
        Self {
            body: response.into_body(),
            buffer: String::new(),
        }
    }

    /// The next event, or `None` when the body ends.
    pub async fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            while let Some(end) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..end + 2).collect();
                if let Some(event) = parse_block(&block) {
                    return Some(event);
                }
            }
            let frame = self.body.frame().await?.ok()?;
            if let Ok(data) = frame.into_data() {
                self.buffer.push_str(std::str::from_utf8(&data).ok()?);
            }
        }
    }

    /// Like [`SseReader::next_event`] but gives up after `timeout`.
    pub async fn next_event_within(&mut self, timeout: Duration) -> Option<SseEvent> {
        tokio::time::timeout(timeout, self.next_event())
            .await
            .ok()
            .flatten()
    }

    /// Drain the remaining events until the body ends.
    pub async fn remaining(mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }
}
