use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use stockroom_core::{AggregateId, ExpectedVersion};
use std::sync::Arc;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: produced by an aggregate's `handle()`
/// 2. **UncommittedEvent**: serialized and wrapped with stream metadata
/// 3. **StoredEvent**: persisted with an assigned `sequence_number`
/// 4. **EventEnvelope**: published to the bus for projections
///
/// Use `UncommittedEvent::from_typed()` to build one from a typed domain event;
/// it captures `event_type`, schema version and business time alongside the
/// JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are assigned by the store during append. They start at 1,
/// are gap-free per stream and never change. The sequence number of the last
/// event is the stream revision that `ExpectedVersion::Exact` compares against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert a stored event into an envelope for publication.
    pub fn to_envelope(&self) -> stockroom_events::EventEnvelope<JsonValue> {
        stockroom_events::EventEnvelope::new(
            self.event_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.event_type.clone(),
            self.payload.clone(),
        )
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** as opposed to the business-rule
/// failures an aggregate returns. `Concurrency` is the only retryable one.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, EventStoreError::Concurrency(_))
    }
}

/// Append-only event store.
///
/// Events are organized into **streams**, one per aggregate instance, keyed by
/// `aggregate_id`. Within a stream events have sequence numbers 1, 2, 3, ...
///
/// ## Append Semantics
///
/// `append()`:
/// - Validates that every event in the batch targets the same stream
/// - Checks optimistic concurrency (current revision must match `expected_version`)
/// - Assigns sequence numbers starting at `current_version + 1`
/// - Persists the batch atomically (all or nothing)
///
/// ## Load Semantics
///
/// `load_stream()` returns every event of the stream in sequence order, or an
/// empty vector when the aggregate has never been written.
pub trait EventStore: Send + Sync {
    /// Append events to an aggregate stream (append-only, compare-and-swap).
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for an aggregate.
    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(aggregate_id)
    }
}

impl UncommittedEvent {
    /// Build an uncommitted event from a typed domain event.
    pub fn from_typed<E>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: stockroom_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
