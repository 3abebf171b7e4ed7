//! Pluggable persistence of emitted SSE events, enabling resumption.
//!
//! When a transport is configured with an [`EventStore`], every message it
//! writes to an SSE stream is stored first and the returned id is sent as the
//! event's `id:` field. A client that reconnects with `Last-Event-Id` gets
//! every later event of the same stream replayed before live delivery
//! continues.
//!
//! Event ids are opaque to the transport; the store must be able to recover
//! the stream an id belongs to.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{RwLock, mpsc::UnboundedSender};

use super::{EventId, StreamId, common::server_side_http::ServerSseMessage};
use crate::model::JsonRpcMessage;

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("unknown event id: {0}")]
    UnknownEvent(String),
    #[error("replay target disconnected")]
    Disconnected,
    #[error("event store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Hands replayed events to the reconnected stream.
#[derive(Debug, Clone)]
pub struct ReplaySender {
    tx: UnboundedSender<ServerSseMessage>,
}

impl ReplaySender {
    pub(crate) fn new(tx: UnboundedSender<ServerSseMessage>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event_id: EventId, message: JsonRpcMessage) -> Result<(), EventStoreError> {
        self.tx
            .send(ServerSseMessage::new(Some(event_id), message))
            .map_err(|_| EventStoreError::Disconnected)
    }
}

#[async_trait::async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Persist one message written to `stream_id` and return its event id.
    ///
    /// Ids must be ordered per stream.
    async fn store_event(
        &self,
        stream_id: &StreamId,
        message: &JsonRpcMessage,
    ) -> Result<EventId, EventStoreError>;

    /// Send every event stored after `last_event_id` on the same stream, in
    /// order, and return that stream's id. The anchor itself is not sent.
    async fn replay_events_after(
        &self,
        last_event_id: &str,
        sender: ReplaySender,
    ) -> Result<StreamId, EventStoreError>;
}

#[derive(Debug, Clone)]
struct StoredEvent {
    stream_id: StreamId,
    message: JsonRpcMessage,
}

/// An [`EventStore`] keeping everything in memory.
///
/// Event ids have the form `<stream id>_<sequence>`; the sequence is shared by
/// all streams so ids are totally ordered. Nothing is ever evicted, which
/// makes it suitable for tests and short lived processes only.
#[derive(Debug, Default, Clone)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<BTreeMap<u64, StoredEvent>>>,
    sequence: Arc<AtomicU64>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn event_id(stream_id: &str, sequence: u64) -> EventId {
        format!("{stream_id}_{sequence:016}")
    }

    fn parse_event_id(event_id: &str) -> Option<(&str, u64)> {
        let (stream_id, sequence) = event_id.rsplit_once('_')?;
        let sequence = sequence.parse().ok()?;
        Some((stream_id, sequence))
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(
        &self,
        stream_id: &StreamId,
        message: &JsonRpcMessage,
    ) -> Result<EventId, EventStoreError> {
        let mut events = self.events.write().await;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        events.insert(
            sequence,
            StoredEvent {
                stream_id: stream_id.clone(),
                message: message.clone(),
            },
        );
        Ok(Self::event_id(stream_id, sequence))
    }

    async fn replay_events_after(
        &self,
        last_event_id: &str,
        sender: ReplaySender,
    ) -> Result<StreamId, EventStoreError> {
        let (stream_id, anchor) = Self::parse_event_id(last_event_id)
            .ok_or_else(|| EventStoreError::UnknownEvent(last_event_id.to_owned()))?;
        let events = self.events.read().await;
        let stream_id = match events.get(&anchor) {
            Some(event) if event.stream_id.as_ref() == stream_id => event.stream_id.clone(),
            _ => return Err(EventStoreError::UnknownEvent(last_event_id.to_owned())),
        };
        for (sequence, event) in events.range(anchor + 1..) {
            if event.stream_id == stream_id {
                sender.send(Self::event_id(&stream_id, *sequence), event.message.clone())?;
            }
        }
        Ok(stream_id)
    }
}
