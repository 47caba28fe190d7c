use chrono::{DateTime, Utc};

/// A committed fact about an aggregate.
///
/// The `event_type` string is what gets persisted next to the JSON payload,
/// so it must stay stable once events of that type have been stored. Bump
/// `version` when the payload shape changes.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Persisted type tag, e.g. `"inventory.stock.reserved"`.
    fn event_type(&self) -> &'static str;

    fn version(&self) -> u32;

    /// Business time supplied by the command, not the store's clock.
    fn occurred_at(&self) -> DateTime<Utc>;
}
