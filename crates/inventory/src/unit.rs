use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockroom_core::{
    Aggregate, AggregateId, AggregateRoot, LineItemId, OrderId, ShipmentId, StockLocationId,
    VariantId,
};
use stockroom_events::{Command, Event};

use crate::error::InventoryError;

/// Inventory unit identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventoryUnitId(pub AggregateId);

impl InventoryUnitId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for InventoryUnitId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    OnHand,
    Backordered,
    Shipped,
    Returned,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::OnHand => "on_hand",
            UnitState::Backordered => "backordered",
            UnitState::Shipped => "shipped",
            UnitState::Returned => "returned",
        }
    }
}

impl core::fmt::Display for UnitState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root: InventoryUnit (one allocated block of identical items).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryUnit {
    id: InventoryUnitId,
    variant_id: VariantId,
    order_id: OrderId,
    line_item_id: LineItemId,
    shipment_id: ShipmentId,
    quantity: i64,
    state: UnitState,
    stock_location_id: Option<StockLocationId>,
    created_at: Option<DateTime<Utc>>,
    backorder_filled_at: Option<DateTime<Utc>>,
    shipped_at: Option<DateTime<Utc>>,
    returned_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl InventoryUnit {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: InventoryUnitId) -> Self {
        Self {
            id,
            variant_id: VariantId::from_uuid(Uuid::nil()),
            order_id: OrderId::from_uuid(Uuid::nil()),
            line_item_id: LineItemId::from_uuid(Uuid::nil()),
            shipment_id: ShipmentId::from_uuid(Uuid::nil()),
            quantity: 0,
            state: UnitState::OnHand,
            stock_location_id: None,
            created_at: None,
            backorder_filled_at: None,
            shipped_at: None,
            returned_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InventoryUnitId {
        self.id
    }

    pub fn variant_id(&self) -> VariantId {
        self.variant_id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn line_item_id(&self) -> LineItemId {
        self.line_item_id
    }

    pub fn shipment_id(&self) -> ShipmentId {
        self.shipment_id
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn stock_location_id(&self) -> Option<StockLocationId> {
        self.stock_location_id
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn backorder_filled_at(&self) -> Option<DateTime<Utc>> {
        self.backorder_filled_at
    }

    pub fn shipped_at(&self) -> Option<DateTime<Utc>> {
        self.shipped_at
    }

    pub fn returned_at(&self) -> Option<DateTime<Utc>> {
        self.returned_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Only `Returned` is terminal.
    pub fn is_in_terminal_state(&self) -> bool {
        self.state == UnitState::Returned
    }

    pub fn is_backordered(&self) -> bool {
        self.state == UnitState::Backordered
    }

    pub fn is_shipped(&self) -> bool {
        self.state == UnitState::Shipped
    }
}

impl AggregateRoot for InventoryUnit {
    type Id = InventoryUnitId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateInventoryUnit.
///
/// Whether the unit starts `Backordered` is the caller's decision, based on
/// how the originating reservation was satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInventoryUnit {
    pub unit_id: InventoryUnitId,
    pub variant_id: VariantId,
    pub order_id: OrderId,
    pub line_item_id: LineItemId,
    pub shipment_id: ShipmentId,
    pub quantity: i64,
    pub backordered: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillBackorder {
    pub unit_id: InventoryUnitId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipUnit {
    pub unit_id: InventoryUnitId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnUnit {
    pub unit_id: InventoryUnitId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStockLocation {
    pub unit_id: InventoryUnitId,
    pub stock_location_id: StockLocationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryUnitCommand {
    Create(CreateInventoryUnit),
    FillBackorder(FillBackorder),
    Ship(ShipUnit),
    Return(ReturnUnit),
    SetStockLocation(SetStockLocation),
}

impl InventoryUnitCommand {
    pub fn unit_id(&self) -> InventoryUnitId {
        match self {
            InventoryUnitCommand::Create(c) => c.unit_id,
            InventoryUnitCommand::FillBackorder(c) => c.unit_id,
            InventoryUnitCommand::Ship(c) => c.unit_id,
            InventoryUnitCommand::Return(c) => c.unit_id,
            InventoryUnitCommand::SetStockLocation(c) => c.unit_id,
        }
    }
}

impl Command for InventoryUnitCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        self.unit_id().0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUnitCreated {
    pub unit_id: InventoryUnitId,
    pub variant_id: VariantId,
    pub order_id: OrderId,
    pub line_item_id: LineItemId,
    pub shipment_id: ShipmentId,
    pub quantity: i64,
    pub state: UnitState,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackorderFilled {
    pub unit_id: InventoryUnitId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitShipped {
    pub unit_id: InventoryUnitId,
    pub stock_location_id: StockLocationId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReturned {
    pub unit_id: InventoryUnitId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLocationAssigned {
    pub unit_id: InventoryUnitId,
    pub stock_location_id: StockLocationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryUnitEvent {
    InventoryUnitCreated(InventoryUnitCreated),
    BackorderFilled(BackorderFilled),
    UnitShipped(UnitShipped),
    UnitReturned(UnitReturned),
    StockLocationAssigned(StockLocationAssigned),
}

impl InventoryUnitEvent {
    pub fn unit_id(&self) -> InventoryUnitId {
        match self {
            InventoryUnitEvent::InventoryUnitCreated(e) => e.unit_id,
            InventoryUnitEvent::BackorderFilled(e) => e.unit_id,
            InventoryUnitEvent::UnitShipped(e) => e.unit_id,
            InventoryUnitEvent::UnitReturned(e) => e.unit_id,
            InventoryUnitEvent::StockLocationAssigned(e) => e.unit_id,
        }
    }
}

impl Event for InventoryUnitEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryUnitEvent::InventoryUnitCreated(_) => "inventory.unit.created",
            InventoryUnitEvent::BackorderFilled(_) => "inventory.unit.backorder_filled",
            InventoryUnitEvent::UnitShipped(_) => "inventory.unit.shipped",
            InventoryUnitEvent::UnitReturned(_) => "inventory.unit.returned",
            InventoryUnitEvent::StockLocationAssigned(_) => "inventory.unit.location_assigned",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryUnitEvent::InventoryUnitCreated(e) => e.occurred_at,
            InventoryUnitEvent::BackorderFilled(e) => e.occurred_at,
            InventoryUnitEvent::UnitShipped(e) => e.occurred_at,
            InventoryUnitEvent::UnitReturned(e) => e.occurred_at,
            InventoryUnitEvent::StockLocationAssigned(e) => e.occurred_at,
        }
    }
}

impl Aggregate for InventoryUnit {
    type Command = InventoryUnitCommand;
    type Event = InventoryUnitEvent;
    type Error = InventoryError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InventoryUnitEvent::InventoryUnitCreated(e) => {
                self.id = e.unit_id;
                self.variant_id = e.variant_id;
                self.order_id = e.order_id;
                self.line_item_id = e.line_item_id;
                self.shipment_id = e.shipment_id;
                self.quantity = e.quantity;
                self.state = e.state;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            InventoryUnitEvent::BackorderFilled(e) => {
                self.state = UnitState::OnHand;
                self.backorder_filled_at = Some(e.occurred_at);
            }
            InventoryUnitEvent::UnitShipped(e) => {
                self.state = UnitState::Shipped;
                self.stock_location_id = Some(e.stock_location_id);
                self.shipped_at = Some(e.occurred_at);
            }
            InventoryUnitEvent::UnitReturned(e) => {
                self.state = UnitState::Returned;
                self.returned_at = Some(e.occurred_at);
            }
            InventoryUnitEvent::StockLocationAssigned(e) => {
                self.stock_location_id = Some(e.stock_location_id);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if let InventoryUnitCommand::Create(cmd) = command {
            return self.handle_create(cmd);
        }

        if !self.created {
            return Err(InventoryError::NotFound);
        }
        if command.unit_id() != self.id {
            return Err(InventoryError::AggregateMismatch);
        }

        match command {
            InventoryUnitCommand::Create(_) => Err(InventoryError::AlreadyExists),
            InventoryUnitCommand::FillBackorder(cmd) => self.handle_fill_backorder(cmd),
            InventoryUnitCommand::Ship(cmd) => self.handle_ship(cmd),
            InventoryUnitCommand::Return(cmd) => self.handle_return(cmd),
            InventoryUnitCommand::SetStockLocation(cmd) => self.handle_set_location(cmd),
        }
    }
}

impl InventoryUnit {
    fn handle_create(
        &self,
        cmd: &CreateInventoryUnit,
    ) -> Result<Vec<InventoryUnitEvent>, InventoryError> {
        if self.created {
            return Err(InventoryError::AlreadyExists);
        }
        if cmd.quantity <= 0 {
            return Err(InventoryError::invalid_quantity("quantity", cmd.quantity));
        }

        let state = if cmd.backordered {
            UnitState::Backordered
        } else {
            UnitState::OnHand
        };

        Ok(vec![InventoryUnitEvent::InventoryUnitCreated(
            InventoryUnitCreated {
                unit_id: cmd.unit_id,
                variant_id: cmd.variant_id,
                order_id: cmd.order_id,
                line_item_id: cmd.line_item_id,
                shipment_id: cmd.shipment_id,
                quantity: cmd.quantity,
                state,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_fill_backorder(
        &self,
        cmd: &FillBackorder,
    ) -> Result<Vec<InventoryUnitEvent>, InventoryError> {
        match self.state {
            UnitState::Backordered => Ok(vec![InventoryUnitEvent::BackorderFilled(
                BackorderFilled {
                    unit_id: cmd.unit_id,
                    occurred_at: cmd.occurred_at,
                },
            )]),
            UnitState::OnHand => Ok(vec![]),
            from => Err(InventoryError::InvalidStateTransition {
                from,
                to: UnitState::OnHand,
            }),
        }
    }

    fn handle_ship(&self, cmd: &ShipUnit) -> Result<Vec<InventoryUnitEvent>, InventoryError> {
        if self.state != UnitState::OnHand {
            return Err(InventoryError::InvalidStateTransition {
                from: self.state,
                to: UnitState::Shipped,
            });
        }
        let stock_location_id = self
            .stock_location_id
            .ok_or(InventoryError::StockLocationNotAssigned)?;

        Ok(vec![InventoryUnitEvent::UnitShipped(UnitShipped {
            unit_id: cmd.unit_id,
            stock_location_id,
            quantity: self.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_return(&self, cmd: &ReturnUnit) -> Result<Vec<InventoryUnitEvent>, InventoryError> {
        match self.state {
            UnitState::Shipped => Ok(vec![InventoryUnitEvent::UnitReturned(UnitReturned {
                unit_id: cmd.unit_id,
                quantity: self.quantity,
                occurred_at: cmd.occurred_at,
            })]),
            UnitState::Returned => Err(InventoryError::AlreadyReturned),
            state => Err(InventoryError::CannotReturnFromNonShipped { state }),
        }
    }

    fn handle_set_location(
        &self,
        cmd: &SetStockLocation,
    ) -> Result<Vec<InventoryUnitEvent>, InventoryError> {
        if self.stock_location_id == Some(cmd.stock_location_id) {
            return Ok(vec![]);
        }

        Ok(vec![InventoryUnitEvent::StockLocationAssigned(
            StockLocationAssigned {
                unit_id: cmd.unit_id,
                stock_location_id: cmd.stock_location_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}
