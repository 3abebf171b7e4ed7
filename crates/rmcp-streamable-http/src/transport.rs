//! # Transport
//!
//! The server side of the streamable HTTP transport.
//!
//! | piece | role |
//! | :-- | :-- |
//! | [`SessionTransport`] | one logical session: validation, correlation, streams |
//! | [`SessionRegistry`] | routes a session id to its live transport |
//! | [`EventStore`] | optional persistence of SSE events for resumption |
//! | [`StreamableHttpService`] | a `tower` service creating and routing transports |
//!
//! Each transport is driven by [`crate::serve_transport`], which hands client
//! messages to a [`crate::Dispatcher`].

use std::sync::Arc;

pub mod common;
pub mod event_store;
pub mod registry;
pub mod streamable_http_server;

pub use common::server_side_http::{BoxResponse, ServerSseMessage, SessionId, session_id};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, ReplaySender};
pub use registry::SessionRegistry;
pub use streamable_http_server::{
    StreamableHttpServerConfig,
    session::{SessionTransport, SessionTransportConfig, TransportResponse},
};
#[cfg(feature = "tower")]
#[cfg_attr(docsrs, doc(cfg(feature = "tower")))]
pub use streamable_http_server::tower::StreamableHttpService;

/// Identifies one SSE stream within a session.
pub type StreamId = Arc<str>;
pub type EventId = String;

/// The stream key of the session's standalone `GET` stream.
pub const STANDALONE_STREAM_ID: &str = "_GET_stream";
