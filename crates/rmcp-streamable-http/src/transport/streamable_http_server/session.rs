//! The per-session streamable HTTP transport.
//!
//! A [`SessionTransport`] owns one logical session. Every HTTP exchange of
//! that session goes through [`SessionTransport::accept_request`]:
//!
//! * `POST` carries client messages. Bodies containing requests open a fresh
//!   *request stream* that stays open until each of those requests has been
//!   answered through [`SessionTransport::send`]; bodies with only
//!   notifications or responses are accepted with `202`.
//! * `GET` opens the *standalone stream*, the single channel for server
//!   initiated messages, or resumes a stream from `Last-Event-Id` when an
//!   event store is configured.
//! * `DELETE` terminates the session.
//!
//! Client messages are handed to the dispatcher through the channel returned
//! by [`SessionTransport::new`]; see [`crate::serve_transport`].

use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::{Arc, OnceLock, Weak},
    time::Duration,
};

use bytes::Bytes;
use futures::{FutureExt, StreamExt, stream::BoxStream};
use http::{HeaderMap, Method, Request, StatusCode};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    TransportError,
    model::{
        AuthInfo, Envelope, InboundMessage, JsonRpcMessage, ProtocolVersion, RequestId,
        SUPPORTED_PROTOCOL_VERSIONS, classify, is_initialize_request,
    },
    transport::{
        EventId, STANDALONE_STREAM_ID, SessionId, SessionRegistry, StreamId,
        common::{
            http_header::{
                EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_MCP_PROTOCOL_VERSION,
                HEADER_SESSION_ID, JSON_MIME_TYPE,
            },
            server_side_http::{
                BoxResponse, DEFAULT_AUTO_PING_INTERVAL, ServerSseMessage, accepts,
                empty_response, error_response, has_json_content_type, json_response,
                session_id, sse_stream_response,
            },
        },
        event_store::{EventStore, ReplaySender},
    },
};

pub type SessionIdGenerator = Arc<dyn Fn() -> SessionId + Send + Sync>;
pub type SessionInitializedCallback = Arc<dyn Fn(&SessionId) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(Option<&SessionId>) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Configuration of one [`SessionTransport`].
///
/// Without a session id generator the transport runs stateless: no session
/// id is issued and no request is checked against one.
#[derive(Clone)]
pub struct SessionTransportConfig {
    pub session_id_generator: Option<SessionIdGenerator>,
    /// Answer request batches with a single JSON body instead of an SSE stream.
    pub json_response: bool,
    pub event_store: Option<Arc<dyn EventStore>>,
    /// The ping interval for SSE streams, `None` disables pings.
    pub sse_keep_alive: Option<Duration>,
    /// Log every inbound and outbound message at debug level.
    pub enable_logging: bool,
    pub on_session_initialized: Option<SessionInitializedCallback>,
    pub on_close: Option<CloseCallback>,
    pub on_error: Option<ErrorCallback>,
    /// Where the transport registers itself once it has a session id.
    pub registry: Option<SessionRegistry>,
    pub cancellation_token: CancellationToken,
}

impl Default for SessionTransportConfig {
    fn default() -> Self {
        Self {
            session_id_generator: Some(Arc::new(session_id) as SessionIdGenerator),
            json_response: false,
            event_store: None,
            sse_keep_alive: Some(DEFAULT_AUTO_PING_INTERVAL),
            enable_logging: false,
            on_session_initialized: None,
            on_close: None,
            on_error: None,
            registry: None,
            cancellation_token: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for SessionTransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransportConfig")
            .field("stateful", &self.session_id_generator.is_some())
            .field("json_response", &self.json_response)
            .field("event_store", &self.event_store.is_some())
            .field("sse_keep_alive", &self.sse_keep_alive)
            .field("enable_logging", &self.enable_logging)
            .field("registry", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionTransportConfig {
    pub fn stateless() -> Self {
        Self {
            session_id_generator: None,
            ..Default::default()
        }
    }

    pub fn with_session_id_generator(
        mut self,
        generator: impl Fn() -> SessionId + Send + Sync + 'static,
    ) -> Self {
        self.session_id_generator = Some(Arc::new(generator) as SessionIdGenerator);
        self
    }

    pub fn with_json_response(mut self, json_response: bool) -> Self {
        self.json_response = json_response;
        self
    }

    pub fn with_event_store(mut self, event_store: impl EventStore) -> Self {
        self.event_store = Some(Arc::new(event_store) as Arc<dyn EventStore>);
        self
    }

    pub fn with_sse_keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.sse_keep_alive = keep_alive;
        self
    }

    pub fn with_logging(mut self, enable_logging: bool) -> Self {
        self.enable_logging = enable_logging;
        self
    }

    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_cancellation_token(mut self, ct: CancellationToken) -> Self {
        self.cancellation_token = ct;
        self
    }

    pub fn on_session_initialized(
        mut self,
        callback: impl Fn(&SessionId) + Send + Sync + 'static,
    ) -> Self {
        self.on_session_initialized = Some(Arc::new(callback) as SessionInitializedCallback);
        self
    }

    pub fn on_close(mut self, callback: impl Fn(Option<&SessionId>) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(callback) as CloseCallback);
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback) as ErrorCallback);
        self
    }

    pub fn is_stateful(&self) -> bool {
        self.session_id_generator.is_some()
    }
}

/// The outcome of a successfully accepted HTTP exchange.
pub enum TransportResponse {
    /// Only notifications or responses were posted (`202`).
    Accepted,
    /// An SSE stream: a request stream, the standalone stream or a replay.
    Stream(BoxStream<'static, ServerSseMessage>),
    /// Resolves with the responses of a request batch, in request order.
    Json(oneshot::Receiver<Vec<JsonRpcMessage>>),
    /// The session was terminated by `DELETE`.
    Terminated,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportResponse::Accepted => f.write_str("Accepted"),
            TransportResponse::Stream(_) => f.write_str("Stream"),
            TransportResponse::Json(_) => f.write_str("Json"),
            TransportResponse::Terminated => f.write_str("Terminated"),
        }
    }
}

impl TransportResponse {
    pub fn into_stream(self) -> Option<BoxStream<'static, ServerSseMessage>> {
        match self {
            TransportResponse::Stream(stream) => Some(stream),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Closed,
}

enum StreamSink {
    Sse(mpsc::UnboundedSender<ServerSseMessage>),
    Json(oneshot::Sender<Vec<JsonRpcMessage>>),
}

impl StreamSink {
    fn is_closed(&self) -> bool {
        match self {
            StreamSink::Sse(tx) => tx.is_closed(),
            StreamSink::Json(tx) => tx.is_closed(),
        }
    }
}

struct TransportState {
    phase: Phase,
    initialized: bool,
    protocol_version: Option<ProtocolVersion>,
    streams: HashMap<StreamId, StreamSink>,
    // request ids carried by each request stream, in arrival order
    stream_requests: HashMap<StreamId, Vec<RequestId>>,
    request_to_stream: HashMap<RequestId, StreamId>,
    request_responses: HashMap<RequestId, JsonRpcMessage>,
    inbound_tx: Option<mpsc::Sender<InboundMessage>>,
}

impl TransportState {
    fn new(inbound_tx: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            phase: Phase::Created,
            initialized: false,
            protocol_version: None,
            streams: HashMap::new(),
            stream_requests: HashMap::new(),
            request_to_stream: HashMap::new(),
            request_responses: HashMap::new(),
            inbound_tx: Some(inbound_tx),
        }
    }

    fn standalone_open(&self) -> bool {
        self.streams
            .get(STANDALONE_STREAM_ID)
            .is_some_and(|sink| !sink.is_closed())
    }

    /// Register a sink, dropping sinks whose client has gone away.
    fn insert_stream(&mut self, stream_id: StreamId, sink: StreamSink) {
        self.streams.retain(|_, sink| !sink.is_closed());
        self.streams.insert(stream_id, sink);
    }

    fn release_stream(&mut self, stream_id: &StreamId) -> Option<StreamSink> {
        if let Some(request_ids) = self.stream_requests.remove(stream_id) {
            for id in &request_ids {
                self.request_to_stream.remove(id);
                self.request_responses.remove(id);
            }
        }
        self.streams.remove(stream_id)
    }
}

pub struct SessionTransport {
    config: SessionTransportConfig,
    session_id: OnceLock<SessionId>,
    state: Mutex<TransportState>,
    ct: CancellationToken,
    this: Weak<SessionTransport>,
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("session_id", &self.session_id.get())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

const INBOUND_CHANNEL_SIZE: usize = 64;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn requested_protocol_version(message: &JsonRpcMessage) -> Option<&str> {
    match message {
        JsonRpcMessage::Request(request) => request
            .params
            .as_ref()?
            .get("protocolVersion")?
            .as_str(),
        _ => None,
    }
}

impl SessionTransport {
    /// Create a transport and the channel its client messages arrive on.
    pub fn new(
        config: SessionTransportConfig,
    ) -> (Arc<Self>, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let ct = config.cancellation_token.child_token();
        let transport = Arc::new_cyclic(|this| Self {
            config,
            session_id: OnceLock::new(),
            state: Mutex::new(TransportState::new(inbound_tx)),
            ct,
            this: this.clone(),
        });
        (transport, inbound_rx)
    }

    pub async fn start(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        match state.phase {
            Phase::Created => {
                state.phase = Phase::Started;
                Ok(())
            }
            Phase::Started => Err(TransportError::AlreadyStarted),
            Phase::Closed => Err(TransportError::Closed),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.get().cloned()
    }

    pub fn config(&self) -> &SessionTransportConfig {
        &self.config
    }

    /// Cancelled when the transport closes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ct.clone()
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.initialized
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.phase == Phase::Closed
    }

    /// The version negotiated by `initialize`; later requests never change it.
    pub async fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.state.lock().await.protocol_version.clone()
    }

    fn report(&self, error: TransportError) -> TransportError {
        tracing::error!(session_id = ?self.session_id.get(), %error, "transport error");
        if let Some(on_error) = &self.config.on_error {
            on_error(&error);
        }
        error
    }

    /// Handle one HTTP exchange and render the HTTP response.
    ///
    /// A panic while handling is turned into a `-32603` internal error.
    pub async fn handle_request(&self, request: Request<Bytes>) -> BoxResponse {
        let result = self.accept_guarded(request).await;
        self.render(result).await
    }

    pub(crate) async fn accept_guarded(
        &self,
        request: Request<Bytes>,
    ) -> Result<TransportResponse, TransportError> {
        match AssertUnwindSafe(self.accept_request(request))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(session_id = ?self.session_id.get(), "panicked while handling request");
                Err(TransportError::Internal("request handler panicked".into()))
            }
        }
    }

    /// Validate and route one HTTP exchange.
    pub async fn accept_request(
        &self,
        request: Request<Bytes>,
    ) -> Result<TransportResponse, TransportError> {
        match self.state.lock().await.phase {
            Phase::Created => return Err(TransportError::NotStarted),
            Phase::Closed => return Err(TransportError::Closed),
            Phase::Started => {}
        }
        let (parts, body) = request.into_parts();
        match parts.method {
            Method::GET => self.handle_get(&parts.headers).await,
            Method::POST => self.handle_post(parts, body).await,
            Method::DELETE => self.handle_delete(&parts.headers).await,
            _ => Err(TransportError::MethodNotAllowed),
        }
    }

    /// Render the outcome of [`SessionTransport::accept_request`] as an HTTP response.
    ///
    /// JSON results are awaited here, so the returned response is complete.
    /// If the transport closes first the exchange ends with an empty `202`.
    pub async fn render(&self, result: Result<TransportResponse, TransportError>) -> BoxResponse {
        let session_id = self.session_id.get();
        match result {
            Ok(TransportResponse::Accepted) => empty_response(StatusCode::ACCEPTED, session_id),
            Ok(TransportResponse::Terminated) => empty_response(StatusCode::OK, session_id),
            Ok(TransportResponse::Stream(stream)) => sse_stream_response(
                stream,
                self.config.sse_keep_alive,
                self.ct.clone(),
                session_id,
            ),
            Ok(TransportResponse::Json(pending)) => match pending.await {
                Ok(responses) if responses.len() == 1 => {
                    json_response(StatusCode::OK, &responses[0], session_id)
                }
                Ok(responses) => json_response(StatusCode::OK, &responses, session_id),
                Err(_) => {
                    // closed before every response was sent, end the exchange without a body
                    tracing::debug!(session_id = ?session_id, "transport closed with json responses pending");
                    empty_response(StatusCode::ACCEPTED, session_id)
                }
            },
            Err(error) => {
                if error.is_client_facing() {
                    tracing::debug!(session_id = ?session_id, %error, "rejected request");
                } else {
                    tracing::error!(session_id = ?session_id, %error, "failed to handle request");
                }
                error_response(&error, session_id)
            }
        }
    }

    async fn handle_get(&self, headers: &HeaderMap) -> Result<TransportResponse, TransportError> {
        if !accepts(headers, EVENT_STREAM_MIME_TYPE) {
            return Err(TransportError::NotAcceptable(
                "Client must accept text/event-stream",
            ));
        }
        self.validate_session(headers).await?;

        if let Some(event_store) = &self.config.event_store {
            if let Some(last_event_id) = header_str(headers, HEADER_LAST_EVENT_ID) {
                return self.replay_events(&**event_store, last_event_id).await;
            }
        }

        let mut state = self.state.lock().await;
        if state.standalone_open() {
            return Err(TransportError::Conflict);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.insert_stream(STANDALONE_STREAM_ID.into(), StreamSink::Sse(tx));
        tracing::debug!(session_id = ?self.session_id.get(), "standalone stream opened");
        Ok(TransportResponse::Stream(
            UnboundedReceiverStream::new(rx).boxed(),
        ))
    }

    async fn replay_events(
        &self,
        event_store: &dyn EventStore,
        last_event_id: &str,
    ) -> Result<TransportResponse, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        tracing::debug!(session_id = ?self.session_id.get(), %last_event_id, "resuming stream");
        // held until the sink is registered, `send` cannot interleave with the replay
        let mut state = self.state.lock().await;
        if state.phase == Phase::Closed {
            return Err(TransportError::Closed);
        }
        let stream_id = match event_store
            .replay_events_after(last_event_id, ReplaySender::new(tx.clone()))
            .await
        {
            Ok(stream_id) => stream_id,
            Err(error) => {
                // keep the connection, it still serves as a live stream until closed
                self.report(TransportError::EventStore(error));
                StreamId::from(format!("_replay_{}", session_id()))
            }
        };

        if stream_id.as_ref() == STANDALONE_STREAM_ID && state.standalone_open() {
            return Err(TransportError::Conflict);
        }
        state.insert_stream(stream_id, StreamSink::Sse(tx));
        Ok(TransportResponse::Stream(
            UnboundedReceiverStream::new(rx).boxed(),
        ))
    }

    async fn handle_post(
        &self,
        parts: http::request::Parts,
        body: Bytes,
    ) -> Result<TransportResponse, TransportError> {
        let headers = &parts.headers;
        if !(accepts(headers, JSON_MIME_TYPE) && accepts(headers, EVENT_STREAM_MIME_TYPE)) {
            return Err(TransportError::NotAcceptable(
                "Client must accept both application/json and text/event-stream",
            ));
        }
        if !has_json_content_type(headers) {
            return Err(TransportError::UnsupportedMediaType);
        }

        let messages = Envelope::parse(&body)?.into_messages();
        if messages.iter().any(is_initialize_request) {
            self.initialize(&messages).await?;
        } else {
            self.validate_session(headers).await?;
        }

        if self.config.enable_logging {
            for message in &messages {
                tracing::debug!(session_id = ?self.session_id.get(), ?message, "inbound message");
            }
        }

        let auth_info = parts.extensions.get::<AuthInfo>().cloned();
        let kinds = classify(&messages);
        if !kinds.has_requests() {
            self.forward(messages, auth_info, headers).await?;
            return Ok(TransportResponse::Accepted);
        }
        let request_ids: Vec<RequestId> = kinds.requests.iter().map(|r| r.id.clone()).collect();

        let stream_id: StreamId = session_id();
        let (sink, response) = if self.config.json_response {
            let (tx, rx) = oneshot::channel();
            (StreamSink::Json(tx), TransportResponse::Json(rx))
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                StreamSink::Sse(tx),
                TransportResponse::Stream(UnboundedReceiverStream::new(rx).boxed()),
            )
        };

        {
            let mut state = self.state.lock().await;
            let mut seen = HashSet::new();
            for id in &request_ids {
                if !seen.insert(id) || state.request_to_stream.contains_key(id) {
                    return Err(TransportError::DuplicateRequestId(id.clone()));
                }
            }
            for id in &request_ids {
                state.request_to_stream.insert(id.clone(), stream_id.clone());
            }
            state.stream_requests.insert(stream_id.clone(), request_ids);
            state.insert_stream(stream_id.clone(), sink);
        }
        tracing::debug!(session_id = ?self.session_id.get(), %stream_id, "request stream opened");

        if let Err(error) = self.forward(messages, auth_info, headers).await {
            self.state.lock().await.release_stream(&stream_id);
            return Err(error);
        }
        Ok(response)
    }

    async fn handle_delete(&self, headers: &HeaderMap) -> Result<TransportResponse, TransportError> {
        self.validate_session(headers).await?;
        self.close().await;
        Ok(TransportResponse::Terminated)
    }

    async fn initialize(&self, messages: &[JsonRpcMessage]) -> Result<(), TransportError> {
        let (session_id, version) = {
            let mut state = self.state.lock().await;
            if state.initialized && self.session_id.get().is_some() {
                return Err(TransportError::AlreadyInitialized);
            }
            if messages.len() > 1 {
                return Err(TransportError::InitializeNotSolitary);
            }
            let version =
                ProtocolVersion::negotiate(messages.first().and_then(requested_protocol_version));
            let session_id = self.config.session_id_generator.as_ref().map(|generate| generate());
            if let Some(id) = &session_id {
                if self.session_id.set(id.clone()).is_err() {
                    return Err(TransportError::AlreadyInitialized);
                }
            }
            state.initialized = true;
            state.protocol_version = Some(version.clone());
            (session_id, version)
        };

        tracing::info!(session_id = ?session_id, protocol_version = %version, "session initialized");
        if let Some(id) = session_id {
            if let Some(registry) = &self.config.registry {
                registry.register_weak(id.clone(), self.this.clone()).await;
            }
            if let Some(on_session_initialized) = &self.config.on_session_initialized {
                on_session_initialized(&id);
            }
        }
        Ok(())
    }

    async fn validate_session(&self, headers: &HeaderMap) -> Result<(), TransportError> {
        if !self.config.is_stateful() {
            return Ok(());
        }
        let negotiated = {
            let state = self.state.lock().await;
            if !state.initialized {
                return Err(TransportError::NotInitialized);
            }
            state.protocol_version.clone()
        };

        let mut values = headers.get_all(HEADER_SESSION_ID).iter();
        let Some(value) = values.next() else {
            return Err(TransportError::MissingSessionId);
        };
        if values.next().is_some() {
            return Err(TransportError::InvalidSessionId);
        }
        let expected = self.session_id.get().map(|id| &**id);
        if value.to_str().ok() != expected {
            return Err(TransportError::SessionNotFound);
        }

        if let Some(version) = header_str(headers, HEADER_MCP_PROTOCOL_VERSION) {
            if !ProtocolVersion::is_supported(version) {
                return Err(TransportError::UnsupportedProtocolVersion {
                    requested: version.to_owned(),
                    supported: SUPPORTED_PROTOCOL_VERSIONS.join(", "),
                });
            }
            if let Some(negotiated) = negotiated.filter(|n| n.as_str() != version) {
                tracing::warn!(
                    session_id = ?self.session_id.get(),
                    %negotiated,
                    requested = %version,
                    "request uses a different protocol version than negotiated"
                );
            }
        }
        Ok(())
    }

    async fn forward(
        &self,
        messages: Vec<JsonRpcMessage>,
        auth_info: Option<AuthInfo>,
        headers: &HeaderMap,
    ) -> Result<(), TransportError> {
        let inbound_tx = self
            .state
            .lock()
            .await
            .inbound_tx
            .clone()
            .ok_or(TransportError::Closed)?;
        for message in messages {
            let inbound = InboundMessage {
                message,
                auth_info: auth_info.clone(),
                headers: headers.clone(),
            };
            if inbound_tx.send(inbound).await.is_err() {
                return Err(TransportError::Internal(
                    "dispatcher is no longer receiving messages".into(),
                ));
            }
        }
        Ok(())
    }

    async fn store_event(&self, stream_id: &StreamId, message: &JsonRpcMessage) -> Option<EventId> {
        let event_store = self.config.event_store.as_ref()?;
        match event_store.store_event(stream_id, message).await {
            Ok(event_id) => Some(event_id),
            Err(error) => {
                // deliver anyway, the event just cannot be replayed
                self.report(TransportError::EventStore(error));
                None
            }
        }
    }

    /// Deliver an outbound message.
    ///
    /// Responses and errors are routed to the stream of the request they
    /// answer (their own id, or `related_request_id` for an error without
    /// one). Other messages go to the stream of `related_request_id` if
    /// given, else to the standalone stream; without an open standalone
    /// stream they are dropped.
    ///
    /// Once every request of a stream has been answered the stream is closed,
    /// or in JSON mode its pending result resolves.
    pub async fn send(
        &self,
        message: JsonRpcMessage,
        related_request_id: Option<RequestId>,
    ) -> Result<(), TransportError> {
        let request_id = message.response_id().cloned().or(related_request_id);
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.phase == Phase::Closed {
            return Err(TransportError::Closed);
        }
        if self.config.enable_logging {
            tracing::debug!(session_id = ?self.session_id.get(), ?message, ?request_id, "outbound message");
        }

        let Some(request_id) = request_id else {
            if message.is_response_or_error() {
                return Err(self.report(TransportError::UnroutableResponse));
            }
            let Some(StreamSink::Sse(tx)) = state.streams.get(STANDALONE_STREAM_ID) else {
                tracing::debug!(session_id = ?self.session_id.get(), "no standalone stream, message dropped");
                return Ok(());
            };
            let tx = tx.clone();
            let standalone: StreamId = STANDALONE_STREAM_ID.into();
            let event_id = self.store_event(&standalone, &message).await;
            if tx.send(ServerSseMessage::new(event_id, message)).is_err() {
                tracing::debug!(session_id = ?self.session_id.get(), "standalone stream was closed by the client");
                state.streams.remove(STANDALONE_STREAM_ID);
            }
            return Ok(());
        };

        let Some(stream_id) = state.request_to_stream.get(&request_id).cloned() else {
            return Err(self.report(TransportError::NoConnection(request_id)));
        };

        if !self.config.json_response {
            let event_id = self.store_event(&stream_id, &message).await;
            match state.streams.get(&stream_id) {
                Some(StreamSink::Sse(tx)) => {
                    if tx
                        .send(ServerSseMessage::new(event_id, message.clone()))
                        .is_err()
                    {
                        tracing::debug!(%stream_id, "request stream was closed by the client");
                    }
                }
                _ => tracing::debug!(%stream_id, "no live connection for request stream"),
            }
        }

        if message.is_response_or_error() {
            state.request_responses.insert(request_id, message);
            let complete = state.stream_requests.get(&stream_id).is_some_and(|ids| {
                ids.iter()
                    .all(|id| state.request_responses.contains_key(id))
            });
            if complete {
                let request_ids = state.stream_requests.remove(&stream_id).unwrap_or_default();
                let responses: Vec<JsonRpcMessage> = request_ids
                    .iter()
                    .filter_map(|id| state.request_responses.remove(id))
                    .collect();
                for id in &request_ids {
                    state.request_to_stream.remove(id);
                }
                match state.streams.remove(&stream_id) {
                    Some(StreamSink::Json(tx)) => {
                        if tx.send(responses).is_err() {
                            tracing::debug!(%stream_id, "json response receiver dropped");
                        }
                    }
                    Some(StreamSink::Sse(_)) => {
                        tracing::debug!(%stream_id, "all responses sent, request stream closed");
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }

    /// Close every stream and terminate the session. Idempotent.
    pub async fn close(&self) {
        let session_id = {
            let mut state = self.state.lock().await;
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            state.streams.clear();
            state.stream_requests.clear();
            state.request_to_stream.clear();
            state.request_responses.clear();
            state.inbound_tx = None;
            self.session_id.get().cloned()
        };
        self.ct.cancel();
        if let (Some(registry), Some(id)) = (&self.config.registry, &session_id) {
            registry.unregister(id).await;
        }
        tracing::info!(session_id = ?session_id, "transport closed");
        if let Some(on_close) = &self.config.on_close {
            on_close(session_id.as_ref());
        }
    }
}
