use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use thiserror::Error;

use stockroom_core::{StockLocationId, VariantId};
use stockroom_events::{Applied, EventEnvelope, Projection, ProjectionError, ProjectionRunner};
use stockroom_inventory::{STOCK_RECORD_AGGREGATE, StockEvent, StockRecordId};

/// Queryable stock levels for one stock record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevelsView {
    pub record_id: StockRecordId,
    pub variant_id: VariantId,
    pub stock_location_id: StockLocationId,
    pub sku: String,
    pub on_hand: i64,
    pub reserved: i64,
    pub available: i64,
    pub backorderable: bool,
    pub deleted: bool,
}

impl StockLevelsView {
    pub fn in_stock(&self) -> bool {
        self.on_hand > 0
    }
}

/// Stock levels projection over decoded stock record events.
///
/// Read models are disposable and rebuildable from the event stream.
#[derive(Debug, Default)]
pub struct StockLevelsProjection {
    records: HashMap<StockRecordId, StockLevelsView>,
    by_pair: HashMap<(VariantId, StockLocationId), StockRecordId>,
}

impl StockLevelsProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, record_id: StockRecordId) -> Option<&StockLevelsView> {
        self.records.get(&record_id)
    }

    /// Look up the record of a (variant, location) pair.
    pub fn find(
        &self,
        variant_id: VariantId,
        stock_location_id: StockLocationId,
    ) -> Option<&StockLevelsView> {
        self.by_pair
            .get(&(variant_id, stock_location_id))
            .and_then(|id| self.records.get(id))
    }

    /// All records, deleted ones included, in no particular order.
    pub fn list(&self) -> impl Iterator<Item = &StockLevelsView> {
        self.records.values()
    }

    fn set_levels(&mut self, record_id: StockRecordId, on_hand: i64, reserved: i64, available: i64) {
        if let Some(view) = self.records.get_mut(&record_id) {
            view.on_hand = on_hand;
            view.reserved = reserved;
            view.available = available;
        }
    }
}

impl Projection for StockLevelsProjection {
    type Ev = StockEvent;

    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>) {
        let event = envelope.payload();
        let record_id = event.record_id();

        match event {
            StockEvent::StockRecordCreated(e) => {
                self.by_pair
                    .insert((e.variant_id, e.stock_location_id), record_id);
                self.records.insert(
                    record_id,
                    StockLevelsView {
                        record_id,
                        variant_id: e.variant_id,
                        stock_location_id: e.stock_location_id,
                        sku: e.sku.clone(),
                        on_hand: e.levels.on_hand,
                        reserved: e.levels.reserved,
                        available: e.levels.available(),
                        backorderable: e.backorderable,
                        deleted: false,
                    },
                );
            }
            StockEvent::StockRecordUpdated(e) => {
                // The (variant, location) pair is fixed at creation; only the
                // descriptive fields move.
                if let Some(view) = self.records.get_mut(&record_id) {
                    view.sku = e.sku.clone();
                    view.backorderable = e.backorderable;
                }
            }
            StockEvent::StockRecordDeleted(_) => {
                if let Some(view) = self.records.get_mut(&record_id) {
                    view.deleted = true;
                }
            }
            StockEvent::StockAdjusted(_)
            | StockEvent::StockReserved(_)
            | StockEvent::StockReleased(_)
            | StockEvent::StockShipped(_) => {
                if let Some(levels) = event.levels() {
                    self.set_levels(record_id, levels.on_hand, levels.reserved, levels.available());
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StockProjectionError {
    #[error("failed to deserialize stock event: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Sequence(#[from] ProjectionError),

    #[error("stock levels read model lock poisoned")]
    Poisoned,
}

/// Thread-safe handle around a `ProjectionRunner<StockLevelsProjection>` that
/// consumes published JSON envelopes.
///
/// Clones share the same read model, so one clone can feed a worker while
/// another serves queries.
#[derive(Debug, Clone, Default)]
pub struct SharedStockLevels {
    inner: Arc<RwLock<ProjectionRunnerCell>>,
}

#[derive(Debug)]
struct ProjectionRunnerCell(ProjectionRunner<StockLevelsProjection>);

impl Default for ProjectionRunnerCell {
    fn default() -> Self {
        Self(ProjectionRunner::new(StockLevelsProjection::new()))
    }
}

impl SharedStockLevels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a published envelope.
    ///
    /// Returns `None` for envelopes of other aggregate types. Duplicates (at or
    /// below the stream cursor) are skipped.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<Option<Applied>, StockProjectionError> {
        if envelope.aggregate_type() != STOCK_RECORD_AGGREGATE {
            return Ok(None);
        }

        let typed = envelope
            .clone()
            .map_payload(serde_json::from_value::<StockEvent>)
            .transpose_payload()
            .map_err(|e| StockProjectionError::Deserialize(e.to_string()))?;

        let mut cell = self
            .inner
            .write()
            .map_err(|_| StockProjectionError::Poisoned)?;
        Ok(Some(cell.0.apply(&typed)?))
    }

    /// Replace the read model with one rebuilt from the given history.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), StockProjectionError> {
        let mut typed = Vec::new();
        for envelope in envelopes {
            if envelope.aggregate_type() != STOCK_RECORD_AGGREGATE {
                continue;
            }
            typed.push(
                envelope
                    .map_payload(serde_json::from_value::<StockEvent>)
                    .transpose_payload()
                    .map_err(|e| StockProjectionError::Deserialize(e.to_string()))?,
            );
        }
        typed.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        let runner = ProjectionRunner::rebuild_from_scratch(StockLevelsProjection::new, &typed)?;
        let mut cell = self
            .inner
            .write()
            .map_err(|_| StockProjectionError::Poisoned)?;
        cell.0 = runner;
        Ok(())
    }

    pub fn get(&self, record_id: StockRecordId) -> Option<StockLevelsView> {
        let cell = self.inner.read().ok()?;
        cell.0.projection().get(record_id).cloned()
    }

    pub fn find(
        &self,
        variant_id: VariantId,
        stock_location_id: StockLocationId,
    ) -> Option<StockLevelsView> {
        let cell = self.inner.read().ok()?;
        cell.0.projection().find(variant_id, stock_location_id).cloned()
    }

    pub fn list(&self) -> Vec<StockLevelsView> {
        match self.inner.read() {
            Ok(cell) => cell.0.projection().list().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use stockroom_core::{AggregateId, OrderId};
    use stockroom_events::Event;
    use stockroom_inventory::{
        MovementAction, MovementEntry, Originator, StockLevels, StockRecordCreated,
        StockRecordUpdated, StockReserved,
    };

    fn envelope(record_id: StockRecordId, seq: u64, event: &StockEvent) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            record_id.0,
            STOCK_RECORD_AGGREGATE,
            seq,
            event.event_type(),
            serde_json::to_value(event).unwrap(),
        )
    }

    fn created(record_id: StockRecordId, variant_id: VariantId, location: StockLocationId) -> StockEvent {
        StockEvent::StockRecordCreated(StockRecordCreated {
            record_id,
            variant_id,
            stock_location_id: location,
            sku: "SKU-1".to_string(),
            backorderable: false,
            levels: StockLevels::new(10, 0),
            occurred_at: Utc::now(),
        })
    }

    fn reserved(record_id: StockRecordId, quantity: i64, levels: StockLevels) -> StockEvent {
        StockEvent::StockReserved(StockReserved {
            record_id,
            movement: MovementEntry {
                quantity: -quantity,
                action: MovementAction::Reserved,
                originator: Originator::Customer,
                reason: None,
                order_id: Some(OrderId::new()),
            },
            levels,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn tracks_levels_and_skips_duplicates() {
        let shared = SharedStockLevels::new();
        let id = StockRecordId::new(AggregateId::new());
        let (variant, location) = (VariantId::new(), StockLocationId::new());

        let first = envelope(id, 1, &created(id, variant, location));
        let second = envelope(id, 2, &reserved(id, 4, StockLevels::new(10, 4)));

        assert_eq!(shared.apply_envelope(&first).unwrap(), Some(Applied::Applied));
        assert_eq!(shared.apply_envelope(&second).unwrap(), Some(Applied::Applied));
        assert_eq!(shared.apply_envelope(&second).unwrap(), Some(Applied::Duplicate));

        let view = shared.find(variant, location).unwrap();
        assert_eq!(view.record_id, id);
        assert_eq!((view.on_hand, view.reserved, view.available), (10, 4, 6));
        assert!(view.in_stock());
    }

    #[test]
    fn sequence_gaps_are_rejected() {
        let shared = SharedStockLevels::new();
        let id = StockRecordId::new(AggregateId::new());
        shared
            .apply_envelope(&envelope(id, 1, &created(id, VariantId::new(), StockLocationId::new())))
            .unwrap();

        let err = shared
            .apply_envelope(&envelope(id, 3, &reserved(id, 1, StockLevels::new(10, 1))))
            .unwrap_err();
        assert!(matches!(
            err,
            StockProjectionError::Sequence(ProjectionError::SequenceGap { last: 1, found: 3, .. })
        ));
        assert_eq!(shared.get(id).unwrap().reserved, 0);
    }

    #[test]
    fn other_aggregates_are_ignored() {
        let shared = SharedStockLevels::new();
        let other = EventEnvelope::new(
            Uuid::now_v7(),
            AggregateId::new(),
            "inventory.unit",
            1,
            "inventory.unit.created",
            JsonValue::Null,
        );
        assert_eq!(shared.apply_envelope(&other).unwrap(), None);
        assert!(shared.list().is_empty());
    }

    #[test]
    fn update_refreshes_descriptive_fields() {
        let shared = SharedStockLevels::new();
        let id = StockRecordId::new(AggregateId::new());
        let (variant, location) = (VariantId::new(), StockLocationId::new());

        shared
            .apply_envelope(&envelope(id, 1, &created(id, variant, location)))
            .unwrap();
        let updated = StockEvent::StockRecordUpdated(StockRecordUpdated {
            record_id: id,
            variant_id: variant,
            stock_location_id: location,
            sku: "SKU-2".to_string(),
            backorderable: true,
            occurred_at: Utc::now(),
        });
        shared.apply_envelope(&envelope(id, 2, &updated)).unwrap();

        let view = shared.find(variant, location).unwrap();
        assert_eq!(view.sku, "SKU-2");
        assert!(view.backorderable);
        assert_eq!(shared.list().len(), 1);
    }

    #[test]
    fn rebuild_replays_out_of_order_history() {
        let shared = SharedStockLevels::new();
        let id = StockRecordId::new(AggregateId::new());
        let history = vec![
            envelope(id, 2, &reserved(id, 3, StockLevels::new(10, 3))),
            envelope(id, 1, &created(id, VariantId::new(), StockLocationId::new())),
        ];

        shared.rebuild_from_scratch(history).unwrap();
        assert_eq!(shared.get(id).unwrap().available, 7);
    }
}
