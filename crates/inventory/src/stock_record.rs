use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockroom_core::{
    Aggregate, AggregateId, AggregateRoot, OrderId, ShipmentId, StockLocationId, ValueObject,
    VariantId,
};
use stockroom_events::{Command, Event};

use crate::error::InventoryError;
use crate::movement::{MovementAction, MovementEntry, Originator, StockMovement};

/// Stock record identifier (one record per variant + location pair).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockRecordId(pub AggregateId);

impl StockRecordId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for StockRecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// On-hand / reserved counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevels {
    pub on_hand: i64,
    pub reserved: i64,
}

impl StockLevels {
    pub fn new(on_hand: i64, reserved: i64) -> Self {
        Self { on_hand, reserved }
    }

    /// On-hand minus reserved, floored at zero.
    pub fn available(&self) -> i64 {
        (self.on_hand - self.reserved).max(0)
    }

    pub fn in_stock(&self) -> bool {
        self.on_hand > 0
    }

    /// Check the counter invariants for the given backorder policy.
    pub fn validate(&self, backorderable: bool) -> Result<(), InventoryError> {
        if self.reserved < 0 {
            return Err(InventoryError::NegativeReserved {
                reserved: self.reserved,
            });
        }
        if self.on_hand < 0 {
            return Err(InventoryError::NegativeOnHand {
                on_hand: self.on_hand,
            });
        }
        if !backorderable && self.reserved > self.on_hand {
            return Err(InventoryError::ReservedExceedsOnHand {
                reserved: self.reserved,
                on_hand: self.on_hand,
            });
        }
        Ok(())
    }
}

impl ValueObject for StockLevels {}

/// Aggregate root: StockRecord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockRecord {
    id: StockRecordId,
    variant_id: VariantId,
    stock_location_id: StockLocationId,
    sku: String,
    levels: StockLevels,
    backorderable: bool,
    movements: Vec<StockMovement>,
    version: u64,
    created: bool,
    deleted: bool,
}

impl StockRecord {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: StockRecordId) -> Self {
        Self {
            id,
            variant_id: VariantId::from_uuid(Uuid::nil()),
            stock_location_id: StockLocationId::from_uuid(Uuid::nil()),
            sku: String::new(),
            levels: StockLevels::default(),
            backorderable: false,
            movements: Vec::new(),
            version: 0,
            created: false,
            deleted: false,
        }
    }

    /// Build a record in an arbitrary (possibly invalid) state, bypassing every
    /// business rule. Only for exercising `validate_invariants`.
    #[cfg(test)]
    pub(crate) fn with_state_unchecked(
        id: StockRecordId,
        levels: StockLevels,
        backorderable: bool,
    ) -> Self {
        Self {
            levels,
            backorderable,
            created: true,
            ..Self::empty(id)
        }
    }

    pub fn id_typed(&self) -> StockRecordId {
        self.id
    }

    pub fn variant_id(&self) -> VariantId {
        self.variant_id
    }

    pub fn stock_location_id(&self) -> StockLocationId {
        self.stock_location_id
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }

    pub fn levels(&self) -> StockLevels {
        self.levels
    }

    pub fn quantity_on_hand(&self) -> i64 {
        self.levels.on_hand
    }

    pub fn quantity_reserved(&self) -> i64 {
        self.levels.reserved
    }

    pub fn count_available(&self) -> i64 {
        self.levels.available()
    }

    pub fn in_stock(&self) -> bool {
        self.levels.in_stock()
    }

    pub fn is_backorderable(&self) -> bool {
        self.backorderable
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// The movement ledger in append order.
    pub fn movements(&self) -> &[StockMovement] {
        &self.movements
    }

    /// Quantity originally reserved for `order_id` on this record, if any.
    pub fn reservation_for(&self, order_id: OrderId) -> Option<i64> {
        self.movements
            .iter()
            .find(|m| m.action() == MovementAction::Reserved && m.order_id() == Some(order_id))
            .map(|m| -m.quantity())
    }

    /// Reservation still held by `order_id` (reserved minus released and sold).
    pub fn outstanding_for(&self, order_id: OrderId) -> i64 {
        self.movements
            .iter()
            .filter(|m| m.order_id() == Some(order_id))
            .map(|m| match m.action() {
                MovementAction::Reserved | MovementAction::Released => -m.quantity(),
                MovementAction::Sold => m.quantity(),
                MovementAction::Received | MovementAction::Adjustment => 0,
            })
            .sum()
    }

    /// Re-check the counter invariants independent of any operation.
    pub fn validate_invariants(&self) -> Result<(), InventoryError> {
        self.levels.validate(self.backorderable)
    }
}

impl AggregateRoot for StockRecord {
    type Id = StockRecordId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateStockRecord.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStockRecord {
    pub record_id: StockRecordId,
    pub variant_id: VariantId,
    pub stock_location_id: StockLocationId,
    pub sku: String,
    pub quantity_on_hand: i64,
    pub quantity_reserved: i64,
    pub backorderable: bool,
    pub occurred_at: DateTime<Utc>,
}

impl CreateStockRecord {
    /// Non-backorderable record with nothing reserved.
    pub fn new(
        record_id: StockRecordId,
        variant_id: VariantId,
        stock_location_id: StockLocationId,
        sku: impl Into<String>,
        quantity_on_hand: i64,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id,
            variant_id,
            stock_location_id,
            sku: sku.into(),
            quantity_on_hand,
            quantity_reserved: 0,
            backorderable: false,
            occurred_at,
        }
    }

    pub fn with_reserved(mut self, quantity_reserved: i64) -> Self {
        self.quantity_reserved = quantity_reserved;
        self
    }

    pub fn backorderable(mut self, backorderable: bool) -> Self {
        self.backorderable = backorderable;
        self
    }
}

/// Command: AdjustStock (manual on-hand correction or restock).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustStock {
    pub record_id: StockRecordId,
    pub delta: i64,
    pub originator: Originator,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReserveStock (idempotent per order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub record_id: StockRecordId,
    pub quantity: i64,
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStock {
    pub record_id: StockRecordId,
    pub quantity: i64,
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmShipment (the terminal "sale" step).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmShipment {
    pub record_id: StockRecordId,
    pub quantity: i64,
    pub shipment_id: ShipmentId,
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateStockRecord (administrative bulk correction).
///
/// `None` leaves a field as it is. `variant_id` and `stock_location_id` are
/// accepted only when they repeat the current values; the pair is fixed at
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStockRecord {
    pub record_id: StockRecordId,
    pub variant_id: Option<VariantId>,
    pub stock_location_id: Option<StockLocationId>,
    pub sku: Option<String>,
    pub backorderable: Option<bool>,
    pub quantity_on_hand: Option<i64>,
    pub quantity_reserved: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

impl UpdateStockRecord {
    pub fn new(record_id: StockRecordId, occurred_at: DateTime<Utc>) -> Self {
        Self {
            record_id,
            variant_id: None,
            stock_location_id: None,
            sku: None,
            backorderable: None,
            quantity_on_hand: None,
            quantity_reserved: None,
            occurred_at,
        }
    }
}

/// Command: DeleteStockRecord (soft delete; the ledger is retained).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteStockRecord {
    pub record_id: StockRecordId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockCommand {
    Create(CreateStockRecord),
    Adjust(AdjustStock),
    Reserve(ReserveStock),
    Release(ReleaseStock),
    ConfirmShipment(ConfirmShipment),
    Update(UpdateStockRecord),
    Delete(DeleteStockRecord),
}

impl StockCommand {
    pub fn record_id(&self) -> StockRecordId {
        match self {
            StockCommand::Create(c) => c.record_id,
            StockCommand::Adjust(c) => c.record_id,
            StockCommand::Reserve(c) => c.record_id,
            StockCommand::Release(c) => c.record_id,
            StockCommand::ConfirmShipment(c) => c.record_id,
            StockCommand::Update(c) => c.record_id,
            StockCommand::Delete(c) => c.record_id,
        }
    }
}

impl Command for StockCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        self.record_id().0
    }
}

/// Event: StockRecordCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecordCreated {
    pub record_id: StockRecordId,
    pub variant_id: VariantId,
    pub stock_location_id: StockLocationId,
    pub sku: String,
    pub backorderable: bool,
    pub levels: StockLevels,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockAdjusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjusted {
    pub record_id: StockRecordId,
    pub movement: MovementEntry,
    pub levels: StockLevels,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub record_id: StockRecordId,
    pub movement: MovementEntry,
    pub levels: StockLevels,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReleased {
    pub record_id: StockRecordId,
    pub movement: MovementEntry,
    pub levels: StockLevels,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockShipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockShipped {
    pub record_id: StockRecordId,
    pub shipment_id: ShipmentId,
    pub movement: MovementEntry,
    pub levels: StockLevels,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockRecordUpdated (snapshot of the descriptive properties).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecordUpdated {
    pub record_id: StockRecordId,
    pub variant_id: VariantId,
    pub stock_location_id: StockLocationId,
    pub sku: String,
    pub backorderable: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockRecordDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecordDeleted {
    pub record_id: StockRecordId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    StockRecordCreated(StockRecordCreated),
    StockAdjusted(StockAdjusted),
    StockReserved(StockReserved),
    StockReleased(StockReleased),
    StockShipped(StockShipped),
    StockRecordUpdated(StockRecordUpdated),
    StockRecordDeleted(StockRecordDeleted),
}

impl StockEvent {
    pub fn record_id(&self) -> StockRecordId {
        match self {
            StockEvent::StockRecordCreated(e) => e.record_id,
            StockEvent::StockAdjusted(e) => e.record_id,
            StockEvent::StockReserved(e) => e.record_id,
            StockEvent::StockReleased(e) => e.record_id,
            StockEvent::StockShipped(e) => e.record_id,
            StockEvent::StockRecordUpdated(e) => e.record_id,
            StockEvent::StockRecordDeleted(e) => e.record_id,
        }
    }

    /// Counters after this event, for events that change them.
    pub fn levels(&self) -> Option<StockLevels> {
        match self {
            StockEvent::StockRecordCreated(e) => Some(e.levels),
            StockEvent::StockAdjusted(e) => Some(e.levels),
            StockEvent::StockReserved(e) => Some(e.levels),
            StockEvent::StockReleased(e) => Some(e.levels),
            StockEvent::StockShipped(e) => Some(e.levels),
            StockEvent::StockRecordUpdated(_) | StockEvent::StockRecordDeleted(_) => None,
        }
    }

    /// Ledger entry carried by this event, if it records a movement.
    pub fn movement(&self) -> Option<&MovementEntry> {
        match self {
            StockEvent::StockAdjusted(e) => Some(&e.movement),
            StockEvent::StockReserved(e) => Some(&e.movement),
            StockEvent::StockReleased(e) => Some(&e.movement),
            StockEvent::StockShipped(e) => Some(&e.movement),
            StockEvent::StockRecordCreated(_)
            | StockEvent::StockRecordUpdated(_)
            | StockEvent::StockRecordDeleted(_) => None,
        }
    }
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::StockRecordCreated(_) => "inventory.stock.created",
            StockEvent::StockAdjusted(_) => "inventory.stock.adjusted",
            StockEvent::StockReserved(_) => "inventory.stock.reserved",
            StockEvent::StockReleased(_) => "inventory.stock.released",
            StockEvent::StockShipped(_) => "inventory.stock.shipped",
            StockEvent::StockRecordUpdated(_) => "inventory.stock.updated",
            StockEvent::StockRecordDeleted(_) => "inventory.stock.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::StockRecordCreated(e) => e.occurred_at,
            StockEvent::StockAdjusted(e) => e.occurred_at,
            StockEvent::StockReserved(e) => e.occurred_at,
            StockEvent::StockReleased(e) => e.occurred_at,
            StockEvent::StockShipped(e) => e.occurred_at,
            StockEvent::StockRecordUpdated(e) => e.occurred_at,
            StockEvent::StockRecordDeleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StockRecord {
    type Command = StockCommand;
    type Event = StockEvent;
    type Error = InventoryError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StockEvent::StockRecordCreated(e) => {
                self.id = e.record_id;
                self.variant_id = e.variant_id;
                self.stock_location_id = e.stock_location_id;
                self.sku = e.sku.clone();
                self.backorderable = e.backorderable;
                self.levels = e.levels;
                self.created = true;
                self.deleted = false;
            }
            StockEvent::StockAdjusted(e) => {
                self.record_movement(&e.movement, e.occurred_at);
                self.levels = e.levels;
            }
            StockEvent::StockReserved(e) => {
                self.record_movement(&e.movement, e.occurred_at);
                self.levels = e.levels;
            }
            StockEvent::StockReleased(e) => {
                self.record_movement(&e.movement, e.occurred_at);
                self.levels = e.levels;
            }
            StockEvent::StockShipped(e) => {
                self.record_movement(&e.movement, e.occurred_at);
                self.levels = e.levels;
            }
            StockEvent::StockRecordUpdated(e) => {
                self.variant_id = e.variant_id;
                self.stock_location_id = e.stock_location_id;
                self.sku = e.sku.clone();
                self.backorderable = e.backorderable;
            }
            StockEvent::StockRecordDeleted(_) => {
                self.deleted = true;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            StockCommand::Create(cmd) => self.handle_create(cmd),
            StockCommand::Adjust(cmd) => self.handle_adjust(cmd),
            StockCommand::Reserve(cmd) => self.handle_reserve(cmd),
            StockCommand::Release(cmd) => self.handle_release(cmd),
            StockCommand::ConfirmShipment(cmd) => self.handle_confirm_shipment(cmd),
            StockCommand::Update(cmd) => self.handle_update(cmd),
            StockCommand::Delete(cmd) => self.handle_delete(cmd),
        }
    }
}

impl StockRecord {
    fn record_movement(&mut self, entry: &MovementEntry, occurred_at: DateTime<Utc>) {
        let position = self.movements.len() as u64 + 1;
        self.movements
            .push(StockMovement::record(self.id, position, entry, occurred_at));
    }

    fn ensure_record_id(&self, record_id: StockRecordId) -> Result<(), InventoryError> {
        if self.id != record_id {
            return Err(InventoryError::AggregateMismatch);
        }
        Ok(())
    }

    /// Created, addressed correctly, and not soft-deleted.
    fn ensure_live(&self, record_id: StockRecordId) -> Result<(), InventoryError> {
        if !self.created {
            return Err(InventoryError::NotFound);
        }
        self.ensure_record_id(record_id)?;
        if self.deleted {
            return Err(InventoryError::RecordDeleted);
        }
        Ok(())
    }

    fn ensure_positive(field: &'static str, quantity: i64) -> Result<(), InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::invalid_quantity(field, quantity));
        }
        Ok(())
    }

    /// Upper bound for releasing or shipping on behalf of `order_id`.
    ///
    /// Orders that reserved on this record are capped by what they still hold,
    /// so a retried full release/shipment fails instead of consuming another
    /// order's reservation.
    fn order_bound(&self, order_id: OrderId) -> i64 {
        match self.reservation_for(order_id) {
            Some(_) => self.outstanding_for(order_id).min(self.levels.reserved),
            None => self.levels.reserved,
        }
    }

    fn handle_create(&self, cmd: &CreateStockRecord) -> Result<Vec<StockEvent>, InventoryError> {
        if self.created {
            return Err(InventoryError::AlreadyExists);
        }
        if cmd.quantity_on_hand < 0 {
            return Err(InventoryError::invalid_quantity(
                "quantity_on_hand",
                cmd.quantity_on_hand,
            ));
        }
        if cmd.quantity_reserved < 0 {
            return Err(InventoryError::invalid_quantity(
                "quantity_reserved",
                cmd.quantity_reserved,
            ));
        }

        let levels = StockLevels::new(cmd.quantity_on_hand, cmd.quantity_reserved);
        levels.validate(cmd.backorderable)?;

        Ok(vec![StockEvent::StockRecordCreated(StockRecordCreated {
            record_id: cmd.record_id,
            variant_id: cmd.variant_id,
            stock_location_id: cmd.stock_location_id,
            sku: cmd.sku.clone(),
            backorderable: cmd.backorderable,
            levels,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_adjust(&self, cmd: &AdjustStock) -> Result<Vec<StockEvent>, InventoryError> {
        self.ensure_live(cmd.record_id)?;

        if cmd.delta == 0 {
            return Err(InventoryError::invalid_quantity("delta", 0));
        }

        let out_of_range = || InventoryError::invalid_quantity("delta", cmd.delta);
        let on_hand = self
            .levels
            .on_hand
            .checked_add(cmd.delta)
            .ok_or_else(out_of_range)?;
        if cmd.delta < 0 {
            let requested = cmd.delta.checked_neg().ok_or_else(out_of_range)?;
            // Backorderable records may dip below their reservations, never below zero.
            let available = if self.backorderable {
                self.levels.on_hand
            } else {
                self.levels.available()
            };
            if requested > available {
                return Err(InventoryError::InsufficientStock {
                    available,
                    requested,
                });
            }
        }
        let levels = StockLevels::new(on_hand, self.levels.reserved);

        Ok(vec![StockEvent::StockAdjusted(StockAdjusted {
            record_id: cmd.record_id,
            movement: MovementEntry::manual(
                cmd.delta,
                MovementAction::Adjustment,
                cmd.originator,
                cmd.reason.clone(),
            ),
            levels,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reserve(&self, cmd: &ReserveStock) -> Result<Vec<StockEvent>, InventoryError> {
        self.ensure_live(cmd.record_id)?;
        Self::ensure_positive("quantity", cmd.quantity)?;

        if let Some(existing) = self.reservation_for(cmd.order_id) {
            if existing == cmd.quantity {
                return Ok(vec![]);
            }
            return Err(InventoryError::DuplicateReservation {
                existing,
                requested: cmd.quantity,
            });
        }

        let available = self.levels.available();
        if cmd.quantity > available && !self.backorderable {
            return Err(InventoryError::InsufficientStock {
                available,
                requested: cmd.quantity,
            });
        }

        let reserved = self
            .levels
            .reserved
            .checked_add(cmd.quantity)
            .ok_or_else(|| InventoryError::invalid_quantity("quantity", cmd.quantity))?;

        Ok(vec![StockEvent::StockReserved(StockReserved {
            record_id: cmd.record_id,
            // Negative: a reservation consumes available capacity.
            movement: MovementEntry::order(-cmd.quantity, MovementAction::Reserved, cmd.order_id),
            levels: StockLevels::new(self.levels.on_hand, reserved),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(&self, cmd: &ReleaseStock) -> Result<Vec<StockEvent>, InventoryError> {
        self.ensure_live(cmd.record_id)?;
        Self::ensure_positive("quantity", cmd.quantity)?;

        let reserved = self.order_bound(cmd.order_id);
        if cmd.quantity > reserved {
            return Err(InventoryError::InvalidRelease {
                reserved,
                requested: cmd.quantity,
            });
        }

        Ok(vec![StockEvent::StockReleased(StockReleased {
            record_id: cmd.record_id,
            movement: MovementEntry::order(cmd.quantity, MovementAction::Released, cmd.order_id),
            levels: StockLevels::new(self.levels.on_hand, self.levels.reserved - cmd.quantity),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm_shipment(
        &self,
        cmd: &ConfirmShipment,
    ) -> Result<Vec<StockEvent>, InventoryError> {
        self.ensure_live(cmd.record_id)?;
        Self::ensure_positive("quantity", cmd.quantity)?;

        let reserved = self.order_bound(cmd.order_id);
        if cmd.quantity > reserved {
            return Err(InventoryError::InvalidShipment {
                reserved,
                requested: cmd.quantity,
            });
        }
        // Backordered reservations cannot ship until stock is received.
        if cmd.quantity > self.levels.on_hand {
            return Err(InventoryError::InsufficientStock {
                available: self.levels.on_hand,
                requested: cmd.quantity,
            });
        }

        Ok(vec![StockEvent::StockShipped(StockShipped {
            record_id: cmd.record_id,
            shipment_id: cmd.shipment_id,
            movement: MovementEntry::order(-cmd.quantity, MovementAction::Sold, cmd.order_id),
            levels: StockLevels::new(
                self.levels.on_hand - cmd.quantity,
                self.levels.reserved - cmd.quantity,
            ),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update(&self, cmd: &UpdateStockRecord) -> Result<Vec<StockEvent>, InventoryError> {
        self.ensure_live(cmd.record_id)?;

        if let Some(on_hand) = cmd.quantity_on_hand {
            if on_hand < 0 {
                return Err(InventoryError::invalid_quantity("quantity_on_hand", on_hand));
            }
        }
        if let Some(reserved) = cmd.quantity_reserved {
            if reserved < 0 {
                return Err(InventoryError::invalid_quantity("quantity_reserved", reserved));
            }
        }

        // The record is addressed by its (variant, location) pair.
        if cmd.variant_id.is_some_and(|v| v != self.variant_id) {
            return Err(InventoryError::ImmutableField {
                field: "variant_id",
            });
        }
        if cmd
            .stock_location_id
            .is_some_and(|l| l != self.stock_location_id)
        {
            return Err(InventoryError::ImmutableField {
                field: "stock_location_id",
            });
        }

        let sku = cmd.sku.clone().unwrap_or_else(|| self.sku.clone());
        let backorderable = cmd.backorderable.unwrap_or(self.backorderable);
        let target = StockLevels::new(
            cmd.quantity_on_hand.unwrap_or(self.levels.on_hand),
            cmd.quantity_reserved.unwrap_or(self.levels.reserved),
        );

        let properties_changed = sku != self.sku || backorderable != self.backorderable;
        if !properties_changed && target == self.levels {
            return Ok(vec![]);
        }

        // All-or-nothing: the end state must be valid before anything is emitted.
        target.validate(backorderable)?;

        let mut events = vec![StockEvent::StockRecordUpdated(StockRecordUpdated {
            record_id: cmd.record_id,
            variant_id: self.variant_id,
            stock_location_id: self.stock_location_id,
            sku,
            backorderable,
            occurred_at: cmd.occurred_at,
        })];

        let on_hand_delta = target.on_hand - self.levels.on_hand;
        let reserved_delta = target.reserved - self.levels.reserved;
        let mut levels = self.levels;

        // Releases go first and reservations last so no intermediate state
        // holds more reservations than either end state.
        if reserved_delta < 0 {
            levels.reserved = target.reserved;
            events.push(StockEvent::StockReleased(StockReleased {
                record_id: cmd.record_id,
                movement: MovementEntry::manual(
                    -reserved_delta,
                    MovementAction::Released,
                    Originator::Adjustment,
                    None,
                ),
                levels,
                occurred_at: cmd.occurred_at,
            }));
        }
        if on_hand_delta != 0 {
            levels.on_hand = target.on_hand;
            events.push(StockEvent::StockAdjusted(StockAdjusted {
                record_id: cmd.record_id,
                movement: MovementEntry::manual(
                    on_hand_delta,
                    MovementAction::Adjustment,
                    Originator::Adjustment,
                    None,
                ),
                levels,
                occurred_at: cmd.occurred_at,
            }));
        }
        if reserved_delta > 0 {
            levels.reserved = target.reserved;
            events.push(StockEvent::StockReserved(StockReserved {
                record_id: cmd.record_id,
                movement: MovementEntry::manual(
                    -reserved_delta,
                    MovementAction::Reserved,
                    Originator::Adjustment,
                    None,
                ),
                levels,
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }

    fn handle_delete(&self, cmd: &DeleteStockRecord) -> Result<Vec<StockEvent>, InventoryError> {
        if !self.created {
            return Err(InventoryError::NotFound);
        }
        self.ensure_record_id(cmd.record_id)?;
        if self.deleted {
            return Ok(vec![]);
        }

        Ok(vec![StockEvent::StockRecordDeleted(StockRecordDeleted {
            record_id: cmd.record_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
