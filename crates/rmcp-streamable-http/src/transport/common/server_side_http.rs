//! HTTP response rendering shared by the streamable HTTP server pieces.
//!
//! Events are framed as
//!
//! ```text
//! event: message
//! id: <event id>        (only when the event was stored)
//! data: <json>
//!
//! ```
//!
//! and idle streams emit a `:ping` comment every keep-alive interval.

use std::{convert::Infallible, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use http_body::Frame;
use http_body_util::{BodyExt, Empty, Full, StreamBody, combinators::UnsyncBoxBody};
use tokio_util::sync::CancellationToken;

use super::http_header::{
    ALLOWED_METHODS, EVENT_STREAM_MIME_TYPE, HEADER_SESSION_ID, HEADER_X_ACCEL_BUFFERING,
    JSON_MIME_TYPE,
};
use crate::{
    TransportError,
    model::{JsonRpcMessage, JsonRpcVersion2_0},
    transport::EventId,
};

pub type SessionId = Arc<str>;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

pub type BoxResponseBody = UnsyncBoxBody<Bytes, Infallible>;
pub type BoxResponse = Response<BoxResponseBody>;

pub const DEFAULT_AUTO_PING_INTERVAL: Duration = Duration::from_secs(15);
const PING_FRAME: &[u8] = b":ping\n\n";

/// One message queued for an SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSseMessage {
    pub event_id: Option<EventId>,
    pub message: JsonRpcMessage,
}

impl ServerSseMessage {
    pub fn new(event_id: Option<EventId>, message: JsonRpcMessage) -> Self {
        Self { event_id, message }
    }

    /// Frame this message as one SSE event.
    pub fn to_sse_bytes(&self) -> Result<Bytes, serde_json::Error> {
        // serde_json escapes newlines, so the payload always fits one `data:` line
        let data = serde_json::to_string(&self.message)?;
        let mut output = String::with_capacity(data.len() + 32);
        output.push_str("event: message\n");
        if let Some(id) = &self.event_id {
            output.push_str("id: ");
            output.push_str(id);
            output.push('\n');
        }
        output.push_str("data: ");
        output.push_str(&data);
        output.push_str("\n\n");
        Ok(Bytes::from(output))
    }
}

/// True if any `Accept` header value mentions `mime`.
pub(crate) fn accepts(headers: &HeaderMap, mime: &str) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(mime))
}

pub(crate) fn has_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with(JSON_MIME_TYPE))
}

fn insert_session_id(headers: &mut HeaderMap, session_id: Option<&SessionId>) {
    let Some(session_id) = session_id else {
        return;
    };
    match HeaderValue::from_str(session_id) {
        Ok(value) => {
            headers.insert(HEADER_SESSION_ID, value);
        }
        Err(e) => {
            tracing::warn!(%session_id, error = %e, "session id is not a valid header value");
        }
    }
}

fn response_with(status: StatusCode, body: BoxResponseBody, session_id: Option<&SessionId>) -> BoxResponse {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    insert_session_id(response.headers_mut(), session_id);
    response
}

pub(crate) fn empty_response(status: StatusCode, session_id: Option<&SessionId>) -> BoxResponse {
    response_with(status, Empty::new().boxed_unsync(), session_id)
}

pub(crate) fn json_response(
    status: StatusCode,
    body: &impl serde::Serialize,
    session_id: Option<&SessionId>,
) -> BoxResponse {
    let body = match serde_json::to_vec(body) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize json response");
            return error_response(
                &TransportError::Internal(e.to_string()),
                session_id,
            );
        }
    };
    let mut response = response_with(status, Full::new(Bytes::from(body)).boxed_unsync(), session_id);
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_MIME_TYPE));
    response
}

/// Render an error as a JSON-RPC error envelope with a null id.
pub(crate) fn error_response(error: &TransportError, session_id: Option<&SessionId>) -> BoxResponse {
    let envelope = serde_json::json!({
        "jsonrpc": JsonRpcVersion2_0,
        "error": error.to_error_data(),
        "id": null,
    });
    let body = Full::new(Bytes::from(envelope.to_string())).boxed_unsync();
    let mut response = response_with(error.status_code(), body, session_id);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_MIME_TYPE));
    if matches!(error, TransportError::MethodNotAllowed) {
        headers.insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
    }
    response
}

/// Turn a message stream into a long lived `text/event-stream` response.
///
/// The body ends when `stream` ends or `ct` is cancelled.
pub(crate) fn sse_stream_response<S>(
    stream: S,
    keep_alive: Option<Duration>,
    ct: CancellationToken,
    session_id: Option<&SessionId>,
) -> BoxResponse
where
    S: Stream<Item = ServerSseMessage> + Send + 'static,
{
    let body_stream = async_stream::stream! {
        let mut stream = Box::pin(stream);
        let mut keep_alive_timer = keep_alive.map(|duration| {
            tokio::time::interval_at(tokio::time::Instant::now() + duration, duration)
        });
        loop {
            tokio::select! {
                message = stream.next() => {
                    let Some(message) = message else {
                        break;
                    };
                    match message.to_sse_bytes() {
                        Ok(bytes) => yield Ok::<_, Infallible>(Frame::data(bytes)),
                        Err(e) => tracing::error!(error = %e, "failed to serialize sse message"),
                    }
                }
                _ = async {
                    match keep_alive_timer.as_mut() {
                        Some(timer) => {
                            timer.tick().await;
                        }
                        None => {
                            std::future::pending::<()>().await;
                        }
                    }
                } => {
                    yield Ok(Frame::data(Bytes::from_static(PING_FRAME)));
                }
                _ = ct.cancelled() => break,
            }
        }
    };
    let mut response = response_with(
        StatusCode::OK,
        StreamBody::new(body_stream).boxed_unsync(),
        session_id,
    );
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(HEADER_X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    response
}
