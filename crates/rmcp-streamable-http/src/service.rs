//! Driving a [`SessionTransport`]: handing client messages to a
//! [`Dispatcher`] and giving it a [`Peer`] to answer through.

use std::{future::Future, sync::Arc};

use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;

use crate::{
    ErrorData, TransportError,
    model::{InboundMessage, JsonRpcMessage, RequestId},
    transport::{SessionId, SessionTransport},
};

/// Application logic behind a transport.
///
/// `dispatch` is called once per client message, each on its own task, so
/// requests of one batch are handled concurrently. Requests must eventually
/// be answered through the peer, otherwise their stream never closes.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, message: InboundMessage, peer: Peer) -> impl Future<Output = ()> + Send;
}

impl<F, Fut> Dispatcher for F
where
    F: Fn(InboundMessage, Peer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    fn dispatch(&self, message: InboundMessage, peer: Peer) -> impl Future<Output = ()> + Send {
        self(message, peer)
    }
}

/// The dispatcher's handle for writing back to the client.
#[derive(Clone)]
pub struct Peer {
    transport: Arc<SessionTransport>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("session_id", &self.transport.session_id())
            .finish()
    }
}

impl Peer {
    pub fn new(transport: Arc<SessionTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<SessionTransport> {
        &self.transport
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.transport.session_id()
    }

    /// Send on the standalone stream, or to the request a response answers.
    pub async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.transport.send(message, None).await
    }

    /// Send on the stream of `related`.
    pub async fn send_related(
        &self,
        message: JsonRpcMessage,
        related: RequestId,
    ) -> Result<(), TransportError> {
        self.transport.send(message, Some(related)).await
    }

    pub async fn notify(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), TransportError> {
        self.send(JsonRpcMessage::notification(method, params)).await
    }

    /// A notification delivered while `related` is still in flight, such as progress.
    pub async fn notify_related(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        related: RequestId,
    ) -> Result<(), TransportError> {
        self.send_related(JsonRpcMessage::notification(method, params), related)
            .await
    }

    pub async fn respond(&self, id: RequestId, result: Value) -> Result<(), TransportError> {
        self.send(JsonRpcMessage::response(id, result)).await
    }

    pub async fn respond_error(&self, id: RequestId, error: ErrorData) -> Result<(), TransportError> {
        self.send(JsonRpcMessage::error(Some(id), error)).await
    }
}

/// Start `transport` and pump its client messages into `dispatcher`.
///
/// The returned task ends once the transport is closed and every queued
/// message has been handed over.
pub async fn serve_transport<D: Dispatcher>(
    dispatcher: Arc<D>,
    transport: Arc<SessionTransport>,
    mut inbound: mpsc::Receiver<InboundMessage>,
) -> Result<JoinHandle<()>, TransportError> {
    transport.start().await?;
    let ct = transport.cancellation_token();
    let span = tracing::info_span!("streamable_http_session", session_id = tracing::field::Empty);
    let handle = tokio::spawn(
        async move {
            let peer = Peer::new(transport.clone());
            let mut closing = false;
            let mut session_recorded = false;
            loop {
                tokio::select! {
                    message = inbound.recv() => {
                        let Some(message) = message else {
                            break;
                        };
                        if !session_recorded {
                            // assigned while the initialize request was accepted
                            if let Some(session_id) = transport.session_id() {
                                tracing::Span::current()
                                    .record("session_id", tracing::field::display(&session_id));
                                session_recorded = true;
                            }
                        }
                        let dispatcher = dispatcher.clone();
                        let peer = peer.clone();
                        tokio::spawn(
                            async move { dispatcher.dispatch(message, peer).await }
                                .in_current_span(),
                        );
                    }
                    _ = ct.cancelled(), if !closing => {
                        closing = true;
                        transport.close().await;
                    }
                }
            }
            tracing::debug!(session_id = ?transport.session_id(), "dispatch loop finished");
        }
        .instrument(span),
    );
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::transport::SessionTransportConfig;

    #[tokio::test]
    async fn test_serve_starts_transport_once() {
        let (transport, inbound) = SessionTransport::new(SessionTransportConfig::default());
        let dispatcher = Arc::new(|_: InboundMessage, _: Peer| async {});
        serve_transport(dispatcher, transport.clone(), inbound)
            .await
            .unwrap();
        assert!(matches!(
            transport.start().await,
            Err(TransportError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_pump_ends_on_cancel() {
        let ct = tokio_util::sync::CancellationToken::new();
        let (transport, inbound) = SessionTransport::new(
            SessionTransportConfig::default().with_cancellation_token(ct.clone()),
        );
        let dispatcher = Arc::new(|_: InboundMessage, _: Peer| async {});
        let handle = serve_transport(dispatcher, transport.clone(), inbound)
            .await
            .unwrap();
        ct.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pump should stop")
            .unwrap();
        assert!(transport.is_closed().await);
    }

    #[tokio::test]
    async fn test_peer_send_without_stream_is_dropped() {
        let (transport, _inbound) = SessionTransport::new(SessionTransportConfig::stateless());
        transport.start().await.unwrap();
        let peer = Peer::new(transport);
        peer.notify("notifications/message", Some(json!({"level": "info"})))
            .await
            .unwrap();
        assert!(matches!(
            peer.respond(RequestId::Number(9), json!({})).await,
            Err(TransportError::NoConnection(_))
        ));
    }
}
