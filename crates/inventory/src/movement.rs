//! Stock movement ledger entries.
//!
//! Signed-quantity convention: a movement records the change in *available
//! capacity*, not only in physical units.
//!
//! | action       | sign | effect on counters                  |
//! |--------------|------|-------------------------------------|
//! | `Adjustment` | ±    | `on_hand += quantity`               |
//! | `Reserved`   | −    | `reserved += |quantity|`            |
//! | `Released`   | +    | `reserved -= quantity`              |
//! | `Sold`       | −    | `on_hand` and `reserved` both drop  |
//!
//! A reservation is negative even though `on_hand` is untouched. Reports built
//! on the ledger rely on this; do not flip the sign.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockroom_core::{Entity, OrderId};

use crate::stock_record::StockRecordId;

/// Movement identifier, derived from the owning record and ledger position so
/// that replaying a stream reproduces identical ids.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockMovementId(Uuid);

impl StockMovementId {
    pub(crate) fn for_position(record_id: StockRecordId, position: u64) -> Self {
        Self(Uuid::new_v5(record_id.0.as_uuid(), &position.to_be_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl core::fmt::Display for StockMovementId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementAction {
    Received,
    Sold,
    Reserved,
    Released,
    Adjustment,
}

/// Who or what caused a movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Originator {
    Customer,
    Adjustment,
    Return,
    System,
}

/// Movement data as carried on a stock event (before it gets an identity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementEntry {
    pub quantity: i64,
    pub action: MovementAction,
    pub originator: Originator,
    pub reason: Option<String>,
    pub order_id: Option<OrderId>,
}

impl MovementEntry {
    pub(crate) fn order(quantity: i64, action: MovementAction, order_id: OrderId) -> Self {
        Self {
            quantity,
            action,
            originator: Originator::Customer,
            reason: None,
            order_id: Some(order_id),
        }
    }

    pub(crate) fn manual(
        quantity: i64,
        action: MovementAction,
        originator: Originator,
        reason: Option<String>,
    ) -> Self {
        Self {
            quantity,
            action,
            originator,
            reason,
            order_id: None,
        }
    }
}

/// One immutable ledger entry owned by a stock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    id: StockMovementId,
    stock_record_id: StockRecordId,
    quantity: i64,
    action: MovementAction,
    originator: Originator,
    reason: Option<String>,
    order_id: Option<OrderId>,
    occurred_at: DateTime<Utc>,
}

impl StockMovement {
    pub(crate) fn record(
        stock_record_id: StockRecordId,
        position: u64,
        entry: &MovementEntry,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: StockMovementId::for_position(stock_record_id, position),
            stock_record_id,
            quantity: entry.quantity,
            action: entry.action,
            originator: entry.originator,
            reason: entry.reason.clone(),
            order_id: entry.order_id,
            occurred_at,
        }
    }

    pub fn stock_record_id(&self) -> StockRecordId {
        self.stock_record_id
    }

    /// Signed delta (see module docs for the sign convention).
    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn action(&self) -> MovementAction {
        self.action
    }

    pub fn originator(&self) -> Originator {
        self.originator
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn order_id(&self) -> Option<OrderId> {
        self.order_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

impl Entity for StockMovement {
    type Id = StockMovementId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
