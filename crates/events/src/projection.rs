use crate::{Event, EventEnvelope};

/// A projection builds a read model from an append-only event stream.
///
/// Read models are **disposable**: they can be dropped and rebuilt by replaying
/// events, which stay the source of truth.
///
/// `apply` must be idempotent at the domain level. `ProjectionRunner` already
/// filters duplicate deliveries by sequence number, but replays from scratch
/// will call `apply` again for every event.
pub trait Projection {
    type Ev: Event;

    /// Apply a single event to the projection, updating the read model.
    ///
    /// Events that are irrelevant to the projection are ignored.
    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>);
}
