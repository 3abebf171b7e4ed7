use std::{
    convert::Infallible,
    fmt::Display,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{StreamExt, future::BoxFuture};
use http::{Method, Request};
use http_body::Body;
use http_body_util::BodyExt;

use super::{
    StreamableHttpServerConfig,
    session::{SessionTransport, SessionTransportConfig, TransportResponse},
};
use crate::{
    Dispatcher, TransportError,
    model::Envelope,
    serve_transport,
    transport::{
        SessionRegistry,
        common::{
            http_header::HEADER_SESSION_ID,
            server_side_http::{BoxResponse, error_response, session_id},
        },
    },
};

/// A `tower` service serving the streamable HTTP transport on one endpoint.
///
/// In stateful mode a new [`SessionTransport`] is created for every
/// `initialize` request and later requests are routed to it through the
/// session registry. In stateless mode each request gets its own transport
/// which is discarded once the response is complete.
pub struct StreamableHttpService<D> {
    pub config: StreamableHttpServerConfig,
    registry: SessionRegistry,
    dispatcher: Arc<D>,
}

impl<D> Clone for StreamableHttpService<D> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<D: Dispatcher> StreamableHttpService<D> {
    pub fn new(dispatcher: D, config: StreamableHttpServerConfig) -> Self {
        Self::with_registry(Arc::new(dispatcher), SessionRegistry::new(), config)
    }

    /// Share a registry, for example with an admin endpoint listing sessions.
    pub fn with_registry(
        dispatcher: Arc<D>,
        registry: SessionRegistry,
        config: StreamableHttpServerConfig,
    ) -> Self {
        Self {
            config,
            registry,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Close every live session.
    pub async fn shutdown(&self) {
        self.config.cancellation_token.cancel();
        self.registry.close_all().await;
    }

    fn transport_config(&self) -> SessionTransportConfig {
        let config = SessionTransportConfig {
            session_id_generator: None,
            json_response: self.config.json_response,
            event_store: self.config.event_store.clone(),
            sse_keep_alive: self.config.sse_keep_alive,
            enable_logging: self.config.enable_logging,
            on_session_initialized: None,
            on_close: None,
            on_error: None,
            registry: None,
            cancellation_token: self.config.cancellation_token.child_token(),
        };
        if self.config.stateful_mode {
            config
                .with_session_id_generator(session_id)
                .with_registry(self.registry.clone())
        } else {
            config
        }
    }

    async fn spawn_transport(&self) -> Result<Arc<SessionTransport>, TransportError> {
        let (transport, inbound) = SessionTransport::new(self.transport_config());
        serve_transport(self.dispatcher.clone(), transport.clone(), inbound).await?;
        Ok(transport)
    }

    pub async fn handle<B>(&self, request: Request<B>) -> BoxResponse
    where
        B: Body + Send + 'static,
        B::Error: Display,
    {
        let (parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read request body");
                return error_response(
                    &TransportError::Internal(format!("failed to read request body: {e}")),
                    None,
                );
            }
        };
        let request = Request::from_parts(parts, body);
        if self.config.stateful_mode {
            self.handle_stateful(request).await
        } else {
            self.handle_stateless(request).await
        }
    }

    async fn handle_stateful(&self, request: Request<Bytes>) -> BoxResponse {
        let session_id = request
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        if let Some(session_id) = session_id {
            return match self.registry.get(&session_id).await {
                Some(transport) => transport.handle_request(request).await,
                None => {
                    tracing::debug!(%session_id, "request for unknown session");
                    error_response(&TransportError::SessionNotFound, None)
                }
            };
        }

        // only an initialize request may arrive without a session id
        match *request.method() {
            Method::POST => {}
            Method::GET | Method::DELETE => {
                return error_response(&TransportError::MissingSessionId, None);
            }
            _ => return error_response(&TransportError::MethodNotAllowed, None),
        }
        match Envelope::parse(request.body()) {
            Ok(envelope) if envelope.contains_initialize() => {}
            Ok(_) => return error_response(&TransportError::MissingSessionId, None),
            Err(e) => return error_response(&TransportError::from(e), None),
        }

        let transport = match self.spawn_transport().await {
            Ok(transport) => transport,
            Err(e) => return error_response(&e, None),
        };
        let result = transport.accept_guarded(request).await;
        if result.is_err() {
            transport.close().await;
        }
        transport.render(result).await
    }

    async fn handle_stateless(&self, request: Request<Bytes>) -> BoxResponse {
        let transport = match self.spawn_transport().await {
            Ok(transport) => transport,
            Err(e) => return error_response(&e, None),
        };
        // closes the transport once the response no longer needs it
        let guard = transport.cancellation_token().drop_guard();
        match transport.accept_guarded(request).await {
            Ok(TransportResponse::Stream(stream)) => {
                let stream = stream
                    .map(move |message| {
                        let _guard = &guard;
                        message
                    })
                    .boxed();
                transport.render(Ok(TransportResponse::Stream(stream))).await
            }
            result => {
                let response = transport.render(result).await;
                drop(guard);
                response
            }
        }
    }
}

impl<D, B> tower_service::Service<Request<B>> for StreamableHttpService<D>
where
    D: Dispatcher,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Display + Send,
{
    type Response = BoxResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(request).await) })
    }
}
