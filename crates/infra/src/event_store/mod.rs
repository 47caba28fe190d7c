//! Append-only event store boundary.
//!
//! This module defines an infrastructure-facing abstraction for storing and
//! loading per-aggregate event streams without making any storage assumptions.
//! `append` is a compare-and-swap on the stream revision, which is how
//! optimistic concurrency reaches the domain.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
