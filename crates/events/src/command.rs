use stockroom_core::AggregateId;

/// A command targets a specific aggregate.
///
/// Commands represent **intent** ("reserve 5 units for order A"); they are
/// transient and either rejected or turned into events, which are persisted.
///
/// Each command operates on exactly one aggregate, which is the unit of
/// optimistic concurrency. Different aggregates can be mutated in parallel.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
