//! Reservation workflow: the transaction script that sequences `StockRecord`
//! and `InventoryUnit`.
//!
//! Ordering contract:
//!
//! - **reserve**: reserve on the stock record, then create the unit(s)
//! - **ship**: confirm the shipment on the stock record, then assign the
//!   location to and ship each unit
//! - **return**: return the unit; restocking is a separate, explicit `restock`
//!
//! Each step is its own optimistic-concurrency transaction. Steps are written
//! so that re-running a whole workflow call after a partial failure converges:
//!
//! - reservations are idempotent per order, and unit ids are derived from
//!   (order, stock record, part), so a retried `reserve_line` addresses the
//!   units an earlier attempt created
//! - `ship` skips the stock confirmation when the record already shows this
//!   shipment as sold, and treats units it already shipped as done

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use stockroom_core::{AggregateId, LineItemId, OrderId, ShipmentId, StockLocationId, VariantId};
use stockroom_events::{EventBus, EventEnvelope};
use stockroom_inventory::{
    AdjustStock, ConfirmShipment, CreateInventoryUnit, CreateStockRecord, FillBackorder,
    INVENTORY_UNIT_AGGREGATE, InventoryError, InventoryUnit, InventoryUnitCommand,
    InventoryUnitId, Originator, ReleaseStock, ReserveStock, ReturnUnit, STOCK_RECORD_AGGREGATE,
    SetStockLocation, ShipUnit, StockCommand, StockEvent, StockRecord, StockRecordId, UnitState,
};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;

const STOCK_RECORD_NAMESPACE: Uuid = Uuid::from_u128(0x8c1f_52d4_0b6e_4a37_9e2d_61f0_c4a8_7b13);
const INVENTORY_UNIT_NAMESPACE: Uuid = Uuid::from_u128(0x3e7a_90c2_5d18_4f6b_a0c9_27e4_8b51_d6f2);

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError<InventoryError>),

    #[error("order {order_id} holds no reservation on stock record {record_id}")]
    ReservationMissing {
        record_id: StockRecordId,
        order_id: OrderId,
    },

    #[error("shipment {shipment_id} has no units")]
    EmptyShipment { shipment_id: ShipmentId },

    /// One order holds one reservation per stock record; it belongs to the
    /// line that allocated units for it first.
    #[error(
        "order {order_id} already allocated stock record {record_id} to line {allocated_line}"
    )]
    LineConflict {
        record_id: StockRecordId,
        order_id: OrderId,
        allocated_line: LineItemId,
    },

    #[error("shipment {shipment_id} confirmed {confirmed} units, retry requests {requested}")]
    ShipmentMismatch {
        shipment_id: ShipmentId,
        confirmed: i64,
        requested: i64,
    },
}

impl WorkflowError {
    /// The business-rule error behind this failure, if any.
    pub fn rejection(&self) -> Option<&InventoryError> {
        match self {
            WorkflowError::Dispatch(e) => e.rejection(),
            _ => None,
        }
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, WorkflowError::Dispatch(e) if e.is_concurrency())
    }
}

fn rejected(error: InventoryError) -> WorkflowError {
    WorkflowError::Dispatch(DispatchError::Rejected(error))
}

/// Register stock for a (variant, location) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterStock {
    pub variant_id: VariantId,
    pub stock_location_id: StockLocationId,
    pub sku: String,
    pub quantity_on_hand: i64,
    pub backorderable: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Reserve stock for one order line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveLine {
    pub record_id: StockRecordId,
    pub order_id: OrderId,
    pub line_item_id: LineItemId,
    pub shipment_id: ShipmentId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Ship a set of units of one order out of one stock record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipUnits {
    pub record_id: StockRecordId,
    pub order_id: OrderId,
    pub shipment_id: ShipmentId,
    pub unit_ids: Vec<InventoryUnitId>,
    pub occurred_at: DateTime<Utc>,
}

/// Result of `reserve_line`.
///
/// `on_hand` covers the part of the line satisfied from available stock,
/// `backordered` the remainder (only possible on backorderable records).
#[derive(Debug, Clone)]
pub struct LineReservation {
    pub record: StockRecord,
    pub on_hand: Option<InventoryUnit>,
    pub backordered: Option<InventoryUnit>,
}

impl LineReservation {
    pub fn units(&self) -> impl Iterator<Item = &InventoryUnit> {
        self.on_hand.iter().chain(self.backordered.iter())
    }
}

/// Result of `ship`.
#[derive(Debug, Clone)]
pub struct Shipment {
    pub record: StockRecord,
    pub units: Vec<InventoryUnit>,
}

/// Stable stock record id for a (variant, location) pair.
pub fn stock_record_id(variant_id: VariantId, stock_location_id: StockLocationId) -> StockRecordId {
    let mut name = Vec::with_capacity(32);
    name.extend_from_slice(variant_id.as_uuid().as_bytes());
    name.extend_from_slice(stock_location_id.as_uuid().as_bytes());
    StockRecordId(AggregateId::derive(&STOCK_RECORD_NAMESPACE, &name))
}

/// Stable unit id for one part (`on_hand` or `backordered`) of an order's
/// reservation on a stock record.
pub fn unit_id(order_id: OrderId, record_id: StockRecordId, state: UnitState) -> InventoryUnitId {
    let mut name = Vec::with_capacity(48);
    name.extend_from_slice(order_id.as_uuid().as_bytes());
    name.extend_from_slice(record_id.0.as_uuid().as_bytes());
    name.extend_from_slice(state.as_str().as_bytes());
    InventoryUnitId(AggregateId::derive(&INVENTORY_UNIT_NAMESPACE, &name))
}

fn record_factory(id: AggregateId) -> StockRecord {
    StockRecord::empty(StockRecordId(id))
}

fn unit_factory(id: AggregateId) -> InventoryUnit {
    InventoryUnit::empty(InventoryUnitId(id))
}

#[derive(Debug)]
pub struct ReservationWorkflow<S, B> {
    dispatcher: CommandDispatcher<S, B>,
}

impl<S, B> ReservationWorkflow<S, B> {
    pub fn new(dispatcher: CommandDispatcher<S, B>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<S, B> {
        &self.dispatcher
    }
}

impl<S, B> ReservationWorkflow<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn stock_record(&self, record_id: StockRecordId) -> Result<StockRecord, WorkflowError> {
        Ok(self.dispatcher.load(record_id.0, record_factory)?.aggregate)
    }

    pub fn inventory_unit(&self, unit_id: InventoryUnitId) -> Result<InventoryUnit, WorkflowError> {
        Ok(self.dispatcher.load(unit_id.0, unit_factory)?.aggregate)
    }

    /// Create the stock record of a (variant, location) pair.
    ///
    /// Registering the same pair twice fails with `AlreadyExists`.
    pub fn register_stock(&self, req: &RegisterStock) -> Result<StockRecord, WorkflowError> {
        let record_id = stock_record_id(req.variant_id, req.stock_location_id);
        let cmd = StockCommand::Create(
            CreateStockRecord::new(
                record_id,
                req.variant_id,
                req.stock_location_id,
                req.sku.clone(),
                req.quantity_on_hand,
                req.occurred_at,
            )
            .backorderable(req.backorderable),
        );

        let record = self.stock(&cmd)?;
        info!(%record_id, sku = %req.sku, on_hand = req.quantity_on_hand, "stock registered");
        Ok(record)
    }

    /// Reserve stock for an order line, then allocate inventory units for it.
    pub fn reserve_line(&self, req: &ReserveLine) -> Result<LineReservation, WorkflowError> {
        let cmd = StockCommand::Reserve(ReserveStock {
            record_id: req.record_id,
            quantity: req.quantity,
            order_id: req.order_id,
            occurred_at: req.occurred_at,
        });
        let record = self.stock(&cmd)?;

        // The split is read back from the committed reservation, so a retried
        // call allocates exactly what the first one did.
        let (covered, backordered) = self.reservation_split(req.record_id, req.order_id)?;
        debug!(
            record_id = %req.record_id,
            order_id = %req.order_id,
            covered,
            backordered,
            "reservation split"
        );

        let on_hand = match covered {
            0 => None,
            quantity => Some(self.allocate_unit(req, &record, quantity, UnitState::OnHand)?),
        };
        let backordered = match backordered {
            0 => None,
            quantity => Some(self.allocate_unit(req, &record, quantity, UnitState::Backordered)?),
        };

        info!(
            record_id = %req.record_id,
            order_id = %req.order_id,
            line_item_id = %req.line_item_id,
            quantity = req.quantity,
            "order line reserved"
        );
        Ok(LineReservation {
            record,
            on_hand,
            backordered,
        })
    }

    pub fn fill_backorder(
        &self,
        unit_id: InventoryUnitId,
        occurred_at: DateTime<Utc>,
    ) -> Result<InventoryUnit, WorkflowError> {
        let unit = self.unit(&InventoryUnitCommand::FillBackorder(FillBackorder {
            unit_id,
            occurred_at,
        }))?;
        info!(%unit_id, "backorder filled");
        Ok(unit)
    }

    /// Confirm the shipment on the stock record, then ship each unit from the
    /// record's location.
    ///
    /// Units are checked up front so that a shipment with a unit that cannot
    /// ship is rejected before the stock record is touched. When the record
    /// already shows this shipment as sold (an earlier call failed after
    /// confirming), confirmation is skipped and only the remaining units ship.
    pub fn ship(&self, req: &ShipUnits) -> Result<Shipment, WorkflowError> {
        if req.unit_ids.is_empty() {
            return Err(WorkflowError::EmptyShipment {
                shipment_id: req.shipment_id,
            });
        }

        let confirmed = self.confirmed_shipment(req.record_id, req.order_id, req.shipment_id)?;

        let mut requested: i64 = 0;
        let mut pending = 0;
        let mut units = Vec::with_capacity(req.unit_ids.len());
        for unit_id in &req.unit_ids {
            let unit = self.inventory_unit(*unit_id)?;
            if !unit.is_created() {
                return Err(rejected(InventoryError::NotFound));
            }
            if unit.order_id() != req.order_id {
                return Err(rejected(InventoryError::AggregateMismatch));
            }
            match unit.state() {
                UnitState::OnHand => pending += 1,
                UnitState::Shipped if confirmed.is_some() => {}
                state => {
                    return Err(rejected(InventoryError::InvalidStateTransition {
                        from: state,
                        to: UnitState::Shipped,
                    }));
                }
            }
            requested = requested
                .checked_add(unit.quantity())
                .ok_or_else(|| rejected(InventoryError::InvalidQuantity {
                    field: "quantity",
                    value: unit.quantity(),
                }))?;
            units.push(unit);
        }

        let record = match confirmed {
            Some(confirmed) if confirmed != requested => {
                return Err(WorkflowError::ShipmentMismatch {
                    shipment_id: req.shipment_id,
                    confirmed,
                    requested,
                });
            }
            Some(_) => {
                debug!(shipment_id = %req.shipment_id, pending, "resuming confirmed shipment");
                self.stock_record(req.record_id)?
            }
            None => self.stock(&StockCommand::ConfirmShipment(ConfirmShipment {
                record_id: req.record_id,
                quantity: requested,
                shipment_id: req.shipment_id,
                order_id: req.order_id,
                occurred_at: req.occurred_at,
            }))?,
        };

        for unit in &mut units {
            if unit.state() != UnitState::OnHand {
                continue;
            }
            let unit_id = unit.id_typed();
            self.unit(&InventoryUnitCommand::SetStockLocation(SetStockLocation {
                unit_id,
                stock_location_id: record.stock_location_id(),
                occurred_at: req.occurred_at,
            }))?;
            *unit = self.unit(&InventoryUnitCommand::Ship(ShipUnit {
                unit_id,
                occurred_at: req.occurred_at,
            }))?;
        }

        info!(
            record_id = %req.record_id,
            order_id = %req.order_id,
            shipment_id = %req.shipment_id,
            quantity = requested,
            units = units.len(),
            "shipment confirmed"
        );
        Ok(Shipment { record, units })
    }

    /// Mark a shipped unit as returned. Does not touch stock levels; see `restock`.
    pub fn return_unit(
        &self,
        unit_id: InventoryUnitId,
        occurred_at: DateTime<Utc>,
    ) -> Result<InventoryUnit, WorkflowError> {
        let unit = self.unit(&InventoryUnitCommand::Return(ReturnUnit {
            unit_id,
            occurred_at,
        }))?;
        info!(%unit_id, quantity = unit.quantity(), "unit returned");
        Ok(unit)
    }

    /// Put returned items back on hand.
    pub fn restock(
        &self,
        record_id: StockRecordId,
        quantity: i64,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<StockRecord, WorkflowError> {
        if quantity <= 0 {
            return Err(rejected(InventoryError::InvalidQuantity {
                field: "quantity",
                value: quantity,
            }));
        }

        let record = self.stock(&StockCommand::Adjust(AdjustStock {
            record_id,
            delta: quantity,
            originator: Originator::Return,
            reason,
            occurred_at,
        }))?;
        info!(%record_id, quantity, "stock restocked from return");
        Ok(record)
    }

    /// Release (part of) an order's reservation.
    pub fn cancel_reservation(
        &self,
        record_id: StockRecordId,
        order_id: OrderId,
        quantity: i64,
        occurred_at: DateTime<Utc>,
    ) -> Result<StockRecord, WorkflowError> {
        let record = self.stock(&StockCommand::Release(ReleaseStock {
            record_id,
            quantity,
            order_id,
            occurred_at,
        }))?;
        info!(%record_id, %order_id, quantity, "reservation released");
        Ok(record)
    }

    fn stock(&self, cmd: &StockCommand) -> Result<StockRecord, WorkflowError> {
        Ok(self
            .dispatcher
            .dispatch_with_retry(STOCK_RECORD_AGGREGATE, cmd, record_factory)?
            .aggregate)
    }

    fn unit(&self, cmd: &InventoryUnitCommand) -> Result<InventoryUnit, WorkflowError> {
        Ok(self
            .dispatcher
            .dispatch_with_retry(INVENTORY_UNIT_AGGREGATE, cmd, unit_factory)?
            .aggregate)
    }

    /// (covered by available stock, backordered) for the order's reservation.
    fn reservation_split(
        &self,
        record_id: StockRecordId,
        order_id: OrderId,
    ) -> Result<(i64, i64), WorkflowError> {
        let history = self.dispatcher.load_events::<StockRecord>(record_id.0)?;

        history
            .iter()
            .find_map(|envelope| match envelope.payload() {
                StockEvent::StockReserved(e) if e.movement.order_id == Some(order_id) => {
                    let quantity = -e.movement.quantity;
                    let available_before = e.levels.on_hand - (e.levels.reserved - quantity);
                    let covered = available_before.clamp(0, quantity);
                    Some((covered, quantity - covered))
                }
                _ => None,
            })
            .ok_or_else(|| WorkflowError::ReservationMissing {
                record_id,
                order_id,
            })
    }

    /// Quantity sold for `order_id` under `shipment_id`, if the record already
    /// confirmed that shipment.
    fn confirmed_shipment(
        &self,
        record_id: StockRecordId,
        order_id: OrderId,
        shipment_id: ShipmentId,
    ) -> Result<Option<i64>, WorkflowError> {
        let history = self.dispatcher.load_events::<StockRecord>(record_id.0)?;

        Ok(history.iter().find_map(|envelope| match envelope.payload() {
            StockEvent::StockShipped(e)
                if e.shipment_id == shipment_id && e.movement.order_id == Some(order_id) =>
            {
                Some(-e.movement.quantity)
            }
            _ => None,
        }))
    }

    fn allocate_unit(
        &self,
        req: &ReserveLine,
        record: &StockRecord,
        quantity: i64,
        state: UnitState,
    ) -> Result<InventoryUnit, WorkflowError> {
        let unit_id = unit_id(req.order_id, req.record_id, state);
        let cmd = InventoryUnitCommand::Create(CreateInventoryUnit {
            unit_id,
            variant_id: record.variant_id(),
            order_id: req.order_id,
            line_item_id: req.line_item_id,
            shipment_id: req.shipment_id,
            quantity,
            backordered: state == UnitState::Backordered,
            occurred_at: req.occurred_at,
        });

        match self.unit(&cmd) {
            Err(WorkflowError::Dispatch(DispatchError::Rejected(InventoryError::AlreadyExists))) => {
                let existing = self.inventory_unit(unit_id)?;
                // A second line of the same order would otherwise be handed
                // units backed by the first line's reservation.
                if existing.line_item_id() != req.line_item_id {
                    return Err(WorkflowError::LineConflict {
                        record_id: req.record_id,
                        order_id: req.order_id,
                        allocated_line: existing.line_item_id(),
                    });
                }
                debug!(%unit_id, "unit allocated by an earlier attempt");
                Ok(existing)
            }
            other => other,
        }
    }
}
