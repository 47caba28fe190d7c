//! Business-rule failures of the reservation engine.
//!
//! Every variant is an expected, recoverable outcome. Storage conflicts and
//! infrastructure failures are not represented here; they belong to the
//! persistence boundary.

use thiserror::Error;

use crate::unit::UnitState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InventoryError {
    #[error("invalid quantity for {field}: {value}")]
    InvalidQuantity { field: &'static str, value: i64 },

    #[error("insufficient stock: {available} available, {requested} requested")]
    InsufficientStock { available: i64, requested: i64 },

    #[error("order already reserved {existing}, cannot reserve {requested}")]
    DuplicateReservation { existing: i64, requested: i64 },

    #[error("cannot release {requested}: only {reserved} reserved")]
    InvalidRelease { reserved: i64, requested: i64 },

    #[error("cannot ship {requested}: only {reserved} reserved")]
    InvalidShipment { reserved: i64, requested: i64 },

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: UnitState, to: UnitState },

    #[error("cannot return a unit in state {state}; only shipped units can be returned")]
    CannotReturnFromNonShipped { state: UnitState },

    #[error("inventory unit has already been returned")]
    AlreadyReturned,

    #[error("reserved quantity is negative: {reserved}")]
    NegativeReserved { reserved: i64 },

    #[error("on-hand quantity is negative: {on_hand}")]
    NegativeOnHand { on_hand: i64 },

    #[error("reserved quantity {reserved} exceeds on-hand {on_hand} and the item is not backorderable")]
    ReservedExceedsOnHand { reserved: i64, on_hand: i64 },

    #[error("inventory unit has no stock location assigned")]
    StockLocationNotAssigned,

    #[error("aggregate not found")]
    NotFound,

    #[error("aggregate already exists")]
    AlreadyExists,

    #[error("stock record has been deleted")]
    RecordDeleted,

    #[error("command targets a different aggregate")]
    AggregateMismatch,

    #[error("{field} cannot change after creation")]
    ImmutableField { field: &'static str },
}

impl InventoryError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            InventoryError::InvalidQuantity { .. } => "invalid_quantity",
            InventoryError::InsufficientStock { .. } => "insufficient_stock",
            InventoryError::DuplicateReservation { .. } => "duplicate_reservation",
            InventoryError::InvalidRelease { .. } => "invalid_release",
            InventoryError::InvalidShipment { .. } => "invalid_shipment",
            InventoryError::InvalidStateTransition { .. } => "invalid_state_transition",
            InventoryError::CannotReturnFromNonShipped { .. } => "cannot_return_from_non_shipped",
            InventoryError::AlreadyReturned => "already_returned",
            InventoryError::NegativeReserved { .. } => "negative_reserved",
            InventoryError::NegativeOnHand { .. } => "negative_on_hand",
            InventoryError::ReservedExceedsOnHand { .. } => "reserved_exceeds_on_hand",
            InventoryError::StockLocationNotAssigned => "stock_location_not_assigned",
            InventoryError::NotFound => "not_found",
            InventoryError::AlreadyExists => "already_exists",
            InventoryError::RecordDeleted => "record_deleted",
            InventoryError::AggregateMismatch => "aggregate_mismatch",
            InventoryError::ImmutableField { .. } => "immutable_field",
        }
    }

    pub(crate) fn invalid_quantity(field: &'static str, value: i64) -> Self {
        Self::InvalidQuantity { field, value }
    }
}
