//! Streamable HTTP Server Transport Module
//!
//! [`session::SessionTransport`] handles the exchanges of a single session and
//! is framework agnostic: it takes an `http::Request<Bytes>` and produces an
//! `http::Response`. With the `tower` feature, [`tower::StreamableHttpService`]
//! wraps it into a service that can be mounted in any tower based server.
//!
//! ```ignore
//! use rmcp_streamable_http::transport::{StreamableHttpService, StreamableHttpServerConfig};
//! let service = StreamableHttpService::new(dispatcher, StreamableHttpServerConfig::default());
//! let router = axum::Router::new().nest_service("/mcp", service);
//! ```

pub mod session;
#[cfg(feature = "tower")]
#[cfg_attr(docsrs, doc(cfg(feature = "tower")))]
pub mod tower;

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use super::{EventStore, common::server_side_http::DEFAULT_AUTO_PING_INTERVAL};

/// Configuration for the streamable HTTP server
#[derive(Clone)]
pub struct StreamableHttpServerConfig {
    /// The ping message duration for SSE connections.
    pub sse_keep_alive: Option<Duration>,
    /// If true, the server will create a session for each `initialize` and keep it alive.
    /// Otherwise every request is served by a throwaway stateless transport.
    pub stateful_mode: bool,
    /// Answer request batches with one JSON body instead of an SSE stream.
    pub json_response: bool,
    /// Shared by every session; enables `Last-Event-Id` resumption.
    pub event_store: Option<Arc<dyn EventStore>>,
    pub enable_logging: bool,
    /// Cancelling it closes every session.
    pub cancellation_token: CancellationToken,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: Some(DEFAULT_AUTO_PING_INTERVAL),
            stateful_mode: true,
            json_response: false,
            event_store: None,
            enable_logging: false,
            cancellation_token: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for StreamableHttpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpServerConfig")
            .field("sse_keep_alive", &self.sse_keep_alive)
            .field("stateful_mode", &self.stateful_mode)
            .field("json_response", &self.json_response)
            .field("event_store", &self.event_store.is_some())
            .field("enable_logging", &self.enable_logging)
            .finish_non_exhaustive()
    }
}

impl StreamableHttpServerConfig {
    pub fn with_event_store(mut self, event_store: impl EventStore) -> Self {
        self.event_store = Some(Arc::new(event_store) as Arc<dyn EventStore>);
        self
    }
}
