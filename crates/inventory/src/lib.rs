//! Inventory reservation engine (event-sourced).
//!
//! Two aggregates live here:
//!
//! - [`StockRecord`]: on-hand / reserved counters for one (variant, location)
//!   pair plus its append-only [`StockMovement`] ledger.
//! - [`InventoryUnit`]: one allocated block of identical items moving through
//!   `OnHand | Backordered → Shipped → Returned`.
//!
//! They never reference each other. The calling workflow correlates them by
//! order id. Everything in this crate is deterministic domain logic (no IO, no
//! clock, no storage).

pub mod error;
pub mod movement;
pub mod stock_record;
pub mod unit;

pub use error::InventoryError;
pub use movement::{MovementAction, MovementEntry, Originator, StockMovement, StockMovementId};
pub use stock_record::{
    AdjustStock, ConfirmShipment, CreateStockRecord, DeleteStockRecord, ReleaseStock,
    ReserveStock, StockAdjusted, StockCommand, StockEvent, StockLevels, StockRecord,
    StockRecordCreated, StockRecordDeleted, StockRecordId, StockRecordUpdated, StockReleased,
    StockReserved, StockShipped, UpdateStockRecord,
};
pub use unit::{
    BackorderFilled, CreateInventoryUnit, FillBackorder, InventoryUnit, InventoryUnitCommand,
    InventoryUnitCreated, InventoryUnitEvent, InventoryUnitId, ReturnUnit, SetStockLocation,
    ShipUnit, StockLocationAssigned, UnitReturned, UnitShipped, UnitState,
};

/// Aggregate type tag for stock record streams.
pub const STOCK_RECORD_AGGREGATE: &str = "inventory.stock_record";

/// Aggregate type tag for inventory unit streams.
pub const INVENTORY_UNIT_AGGREGATE: &str = "inventory.unit";
