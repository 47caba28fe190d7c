//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have no identity and are immutable: two instances with the
/// same attribute values are the same value. To "modify" one, build a new one.
///
/// ```ignore
/// #[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// struct StockLevels { on_hand: i64, reserved: i64 }
///
/// impl ValueObject for StockLevels {}
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
