//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store
//!   ↓
//! 2. Rehydrate aggregate (apply historical events to rebuild state)
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events to store (append-only, compare-and-swap on stream revision)
//!   ↓
//! 5. Publish events to bus (for projections)
//! ```
//!
//! A concurrency conflict at step 4 means another writer committed in between.
//! `dispatch_with_retry` then runs the whole pipeline again from step 1, so the
//! aggregate decides against fresh state; a previously decided delta is never
//! re-appended.
//!
//! This module contains no IO itself; it composes infrastructure traits.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use stockroom_core::{Aggregate, AggregateId, ExpectedVersion};
use stockroom_events::{Command, EventBus, EventEnvelope};

use crate::config::{ConfigError, InfraConfig, RetryPolicy};
use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError<E> {
    /// Business rule rejected the command (deterministic, never retried).
    #[error("command rejected: {0}")]
    Rejected(E),
    /// Optimistic concurrency failure (the stream moved since it was read).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// Loaded stream is not a well-formed history for the requested aggregate.
    #[error("corrupt stream: {0}")]
    CorruptStream(String),
    /// Failed to deserialize historical event payloads into the aggregate event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),
    /// Persisting to or loading from the event store failed.
    #[error(transparent)]
    Store(EventStoreError),
    /// Publication failed after a successful append (at-least-once; events are stored).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl<E> DispatchError<E> {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, DispatchError::Concurrency(_))
    }

    /// The business-rule error, if this is a rejection.
    pub fn rejection(&self) -> Option<&E> {
        match self {
            DispatchError::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<EventStoreError> for DispatchError<E> {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

/// An aggregate rehydrated from its stream, with the revision it was read at.
#[derive(Debug, Clone)]
pub struct Loaded<A> {
    pub aggregate: A,
    pub version: u64,
}

/// Outcome of a successful dispatch.
///
/// `committed` is empty when the aggregate decided on a no-op; nothing was
/// appended or published in that case.
#[derive(Debug, Clone)]
pub struct Dispatched<A> {
    pub aggregate: A,
    pub committed: Vec<StoredEvent>,
}

impl<A> Dispatched<A> {
    pub fn is_noop(&self) -> bool {
        self.committed.is_empty()
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// ## Execution Guarantees
///
/// - Events are persisted before publication (if append fails, nothing is published)
/// - Each command operates on a single aggregate stream
/// - Business-rule rejections are returned untouched as `DispatchError::Rejected`
///
/// If publication fails after a successful append the error is returned, but
/// the events are already persisted (at-least-once delivery).
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
    retry: RetryPolicy,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self {
            store,
            bus,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(store: S, bus: B, config: &InfraConfig) -> Self {
        Self::new(store, bus).with_retry_policy(config.retry)
    }

    /// Build with the retry policy read from the `STOCKROOM_*` environment.
    pub fn from_env(store: S, bus: B) -> Result<Self, ConfigError> {
        let config = InfraConfig::from_env()?;
        debug!(
            max_attempts = config.retry.max_attempts,
            backoff_ms = config.retry.backoff.as_millis() as u64,
            "dispatcher configured from environment"
        );
        Ok(Self::from_config(store, bus, &config))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Load and rehydrate an aggregate, returning the stream revision it was read at.
    pub fn load<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Loaded<A>, DispatchError<A::Error>>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream::<A::Error>(aggregate_id, &history)?;

        let mut aggregate = make_aggregate(aggregate_id);
        for stored in &history {
            aggregate.apply(&decode::<A::Event, A::Error>(stored)?);
        }

        Ok(Loaded {
            aggregate,
            version: stream_version(&history),
        })
    }

    /// Load the decoded event history of an aggregate stream.
    pub fn load_events<A>(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope<A::Event>>, DispatchError<A::Error>>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream::<A::Error>(aggregate_id, &history)?;

        let mut events = Vec::with_capacity(history.len());
        for stored in &history {
            let event = decode::<A::Event, A::Error>(stored)?;
            events.push(stored.to_envelope().map_payload(|_| event));
        }
        Ok(events)
    }

    /// Dispatch a command through the full pipeline once.
    ///
    /// The append expects the exact revision that was loaded, so a concurrent
    /// writer turns into `DispatchError::Concurrency`.
    pub fn dispatch<A>(
        &self,
        aggregate_type: &str,
        command: &A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Dispatched<A>, DispatchError<A::Error>>
    where
        A: Aggregate,
        A::Command: Command,
        A::Event: stockroom_events::Event + Serialize + DeserializeOwned,
    {
        let aggregate_id = command.target_aggregate_id();

        // 1-2) Load + rehydrate
        let Loaded {
            mut aggregate,
            version,
        } = self.load(aggregate_id, make_aggregate)?;

        // 3) Decide events (no mutation)
        let decided = aggregate.handle(command).map_err(DispatchError::Rejected)?;
        if decided.is_empty() {
            debug!(%aggregate_id, aggregate_type, version, "command was a no-op");
            return Ok(Dispatched {
                aggregate,
                committed: vec![],
            });
        }

        // 4) Persist (append-only, optimistic)
        let uncommitted = decided
            .iter()
            .map(|ev| UncommittedEvent::from_typed(aggregate_id, aggregate_type, Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self
            .store
            .append(uncommitted, ExpectedVersion::Exact(version))?;

        for ev in &decided {
            aggregate.apply(ev);
        }
        debug!(
            %aggregate_id,
            aggregate_type,
            from_version = version,
            events = committed.len(),
            "events committed"
        );

        // 5) Publish committed events (after append)
        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(Dispatched {
            aggregate,
            committed,
        })
    }

    /// Dispatch, re-running the whole load/decide/append cycle on concurrency
    /// conflicts up to the configured number of attempts.
    pub fn dispatch_with_retry<A>(
        &self,
        aggregate_type: &str,
        command: &A::Command,
        make_aggregate: impl Fn(AggregateId) -> A,
    ) -> Result<Dispatched<A>, DispatchError<A::Error>>
    where
        A: Aggregate,
        A::Command: Command,
        A::Event: stockroom_events::Event + Serialize + DeserializeOwned,
    {
        let mut attempt = 1;
        loop {
            match self.dispatch(aggregate_type, command, &make_aggregate) {
                Err(DispatchError::Concurrency(reason)) if attempt < self.retry.max_attempts => {
                    warn!(
                        aggregate_id = %command.target_aggregate_id(),
                        aggregate_type,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        reason = %reason,
                        "concurrency conflict, retrying command"
                    );
                    attempt += 1;
                    let delay = self.retry.delay_before(attempt);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                other => return other,
            }
        }
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn decode<Ev, E>(stored: &StoredEvent) -> Result<Ev, DispatchError<E>>
where
    Ev: DeserializeOwned,
{
    serde_json::from_value(stored.payload.clone()).map_err(|e| {
        DispatchError::Deserialize(format!(
            "{} #{}: {e}",
            stored.event_type, stored.sequence_number
        ))
    })
}

/// Reject streams a well-behaved store would never return.
fn validate_loaded_stream<E>(
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError<E>> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::CorruptStream(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number != last + 1 {
            return Err(DispatchError::CorruptStream(format!(
                "sequence gap in loaded stream (last={last}, found={})",
                e.sequence_number
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}
