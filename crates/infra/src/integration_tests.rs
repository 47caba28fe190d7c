//! Integration tests for the full event-sourced pipeline.
//!
//! Tests: Workflow → CommandDispatcher → EventStore → EventBus → Projection
//!
//! Verifies:
//! - The reservation workflow sequences stock records and units correctly
//! - Retried workflow calls converge instead of double-applying
//! - Optimistic concurrency conflicts are detected and retried from fresh state
//! - The stock levels read model follows the committed events

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    use chrono::Utc;
    use serde_json::Value as JsonValue;

    use stockroom_core::{
        AggregateId, AggregateRoot, ExpectedVersion, LineItemId, OrderId, ShipmentId,
        StockLocationId, VariantId,
    };
    use stockroom_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
    use stockroom_inventory::{
        AdjustStock, InventoryError, MovementAction, Originator, ReserveStock,
        STOCK_RECORD_AGGREGATE, StockCommand, StockRecord, StockRecordId, UnitState,
        UpdateStockRecord,
    };

    use crate::command_dispatcher::{CommandDispatcher, DispatchError};
    use crate::config::{InfraConfig, RetryPolicy};
    use crate::event_store::{
        EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent,
    };
    use crate::projections::SharedStockLevels;
    use crate::workers::ProjectionWorker;
    use crate::workflow::{
        RegisterStock, ReservationWorkflow, ReserveLine, ShipUnits, WorkflowError, unit_id,
    };

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Workflow = ReservationWorkflow<Arc<InMemoryEventStore>, Bus>;

    fn setup() -> (Workflow, Arc<InMemoryEventStore>, Bus) {
        stockroom_observability::init_for_tests();
        let store = Arc::new(InMemoryEventStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let dispatcher = CommandDispatcher::new(store.clone(), bus.clone());
        (ReservationWorkflow::new(dispatcher), store, bus)
    }

    fn register(workflow: &Workflow, on_hand: i64, backorderable: bool) -> StockRecordId {
        let record = workflow
            .register_stock(&RegisterStock {
                variant_id: VariantId::new(),
                stock_location_id: StockLocationId::new(),
                sku: "SKU-100".to_string(),
                quantity_on_hand: on_hand,
                backorderable,
                occurred_at: Utc::now(),
            })
            .unwrap();
        record.id_typed()
    }

    fn line(record_id: StockRecordId, quantity: i64) -> ReserveLine {
        ReserveLine {
            record_id,
            order_id: OrderId::new(),
            line_item_id: LineItemId::new(),
            shipment_id: ShipmentId::new(),
            quantity,
            occurred_at: Utc::now(),
        }
    }

    fn stream_len(store: &InMemoryEventStore, id: AggregateId) -> usize {
        store.load_stream(id).unwrap().len()
    }

    #[test]
    fn registering_the_same_pair_twice_fails() {
        let (workflow, _, _) = setup();
        let req = RegisterStock {
            variant_id: VariantId::new(),
            stock_location_id: StockLocationId::new(),
            sku: "SKU".to_string(),
            quantity_on_hand: 1,
            backorderable: false,
            occurred_at: Utc::now(),
        };
        workflow.register_stock(&req).unwrap();

        let err = workflow.register_stock(&req).unwrap_err();
        assert_eq!(err.rejection(), Some(&InventoryError::AlreadyExists));
    }

    #[test]
    fn reserve_line_allocates_an_on_hand_unit() {
        let (workflow, _, _) = setup();
        let record_id = register(&workflow, 10, false);
        let req = line(record_id, 4);

        let reservation = workflow.reserve_line(&req).unwrap();
        assert_eq!(reservation.record.quantity_reserved(), 4);
        assert_eq!(reservation.record.count_available(), 6);
        assert!(reservation.backordered.is_none());

        let unit = reservation.on_hand.unwrap();
        assert_eq!(unit.state(), UnitState::OnHand);
        assert_eq!(unit.quantity(), 4);
        assert_eq!(unit.order_id(), req.order_id);
        assert_eq!(unit.variant_id(), reservation.record.variant_id());
    }

    #[test]
    fn reserve_line_splits_backordered_remainder() {
        let (workflow, _, _) = setup();
        let record_id = register(&workflow, 3, true);

        let reservation = workflow.reserve_line(&line(record_id, 5)).unwrap();
        let quantities: Vec<_> = reservation
            .units()
            .map(|u| (u.state(), u.quantity()))
            .collect();
        assert_eq!(
            quantities,
            vec![(UnitState::OnHand, 3), (UnitState::Backordered, 2)]
        );
        assert_eq!(reservation.record.quantity_reserved(), 5);
        assert_eq!(reservation.record.count_available(), 0);
    }

    #[test]
    fn retried_reserve_line_converges() {
        let (workflow, store, _) = setup();
        let record_id = register(&workflow, 3, true);
        let req = line(record_id, 5);

        let first = workflow.reserve_line(&req).unwrap();
        let record_len = stream_len(&store, record_id.0);

        let second = workflow.reserve_line(&req).unwrap();
        assert_eq!(stream_len(&store, record_id.0), record_len);
        assert_eq!(second.record.quantity_reserved(), 5);

        let ids = |r: &crate::workflow::LineReservation| {
            r.units().map(|u| u.id_typed()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(
            ids(&first),
            vec![
                unit_id(req.order_id, req.record_id, UnitState::OnHand),
                unit_id(req.order_id, req.record_id, UnitState::Backordered),
            ]
        );
    }

    #[test]
    fn reserve_line_beyond_stock_is_rejected_without_units() {
        let (workflow, store, _) = setup();
        let record_id = register(&workflow, 2, false);
        let req = line(record_id, 3);

        let err = workflow.reserve_line(&req).unwrap_err();
        assert_eq!(
            err.rejection(),
            Some(&InventoryError::InsufficientStock {
                available: 2,
                requested: 3
            })
        );
        let would_be = unit_id(req.order_id, req.record_id, UnitState::OnHand);
        assert_eq!(stream_len(&store, would_be.0), 0);
    }

    #[test]
    fn ship_confirms_record_then_ships_units() {
        let (workflow, store, _) = setup();
        let record_id = register(&workflow, 10, false);
        let req = line(record_id, 4);
        let reservation = workflow.reserve_line(&req).unwrap();
        let unit_ids: Vec<_> = reservation.units().map(|u| u.id_typed()).collect();

        let shipment = workflow
            .ship(&ShipUnits {
                record_id,
                order_id: req.order_id,
                shipment_id: req.shipment_id,
                unit_ids: unit_ids.clone(),
                occurred_at: Utc::now(),
            })
            .unwrap();

        assert_eq!(shipment.record.quantity_on_hand(), 6);
        assert_eq!(shipment.record.quantity_reserved(), 0);
        let sold = shipment.record.movements().last().unwrap();
        assert_eq!(sold.action(), MovementAction::Sold);
        assert_eq!(sold.quantity(), -4);

        for unit in &shipment.units {
            assert!(unit.is_shipped());
            assert_eq!(
                unit.stock_location_id(),
                Some(shipment.record.stock_location_id())
            );
        }

        // Re-running the same shipment converges without selling again.
        let record_len = stream_len(&store, record_id.0);
        let again = workflow
            .ship(&ShipUnits {
                record_id,
                order_id: req.order_id,
                shipment_id: req.shipment_id,
                unit_ids: unit_ids.clone(),
                occurred_at: Utc::now(),
            })
            .unwrap();
        assert_eq!(again.record.quantity_on_hand(), 6);
        assert!(again.units.iter().all(|u| u.is_shipped()));
        assert_eq!(stream_len(&store, record_id.0), record_len);

        // Shipping the same units under another shipment is refused before
        // the record is touched.
        let err = workflow
            .ship(&ShipUnits {
                record_id,
                order_id: req.order_id,
                shipment_id: ShipmentId::new(),
                unit_ids,
                occurred_at: Utc::now(),
            })
            .unwrap_err();
        assert!(matches!(
            err.rejection(),
            Some(InventoryError::InvalidStateTransition {
                from: UnitState::Shipped,
                ..
            })
        ));
        assert_eq!(workflow.stock_record(record_id).unwrap().quantity_on_hand(), 6);
    }

    #[test]
    fn backordered_units_ship_after_stock_arrives() {
        let (workflow, _, _) = setup();
        let record_id = register(&workflow, 1, true);
        let req = line(record_id, 3);
        let reservation = workflow.reserve_line(&req).unwrap();
        let on_hand = reservation.on_hand.as_ref().unwrap().id_typed();
        let backordered = reservation.backordered.as_ref().unwrap().id_typed();

        let ship = |units: Vec<_>| {
            workflow.ship(&ShipUnits {
                record_id,
                order_id: req.order_id,
                shipment_id: req.shipment_id,
                unit_ids: units,
                occurred_at: Utc::now(),
            })
        };

        let err = ship(vec![on_hand, backordered]).unwrap_err();
        assert!(matches!(
            err.rejection(),
            Some(InventoryError::InvalidStateTransition {
                from: UnitState::Backordered,
                to: UnitState::Shipped
            })
        ));
        assert_eq!(workflow.stock_record(record_id).unwrap().quantity_reserved(), 3);

        // Receive stock, then fill the backorder.
        let receive = StockCommand::Adjust(AdjustStock {
            record_id,
            delta: 2,
            originator: Originator::System,
            reason: Some("purchase receipt".to_string()),
            occurred_at: Utc::now(),
        });
        workflow
            .dispatcher()
            .dispatch(STOCK_RECORD_AGGREGATE, &receive, |id| {
                StockRecord::empty(StockRecordId(id))
            })
            .unwrap();
        let filled = workflow.fill_backorder(backordered, Utc::now()).unwrap();
        assert_eq!(filled.state(), UnitState::OnHand);

        let shipment = ship(vec![on_hand, backordered]).unwrap();
        assert_eq!(shipment.record.quantity_on_hand(), 0);
        assert_eq!(shipment.record.quantity_reserved(), 0);
        assert!(shipment.units.iter().all(|u| u.is_shipped()));
    }

    #[test]
    fn return_and_restock_are_separate_steps() {
        let (workflow, _, _) = setup();
        let record_id = register(&workflow, 5, false);
        let req = line(record_id, 2);
        let unit = workflow.reserve_line(&req).unwrap().on_hand.unwrap();
        workflow
            .ship(&ShipUnits {
                record_id,
                order_id: req.order_id,
                shipment_id: req.shipment_id,
                unit_ids: vec![unit.id_typed()],
                occurred_at: Utc::now(),
            })
            .unwrap();

        let returned = workflow.return_unit(unit.id_typed(), Utc::now()).unwrap();
        assert!(returned.is_in_terminal_state());
        // Returning does not restock on its own.
        assert_eq!(workflow.stock_record(record_id).unwrap().quantity_on_hand(), 3);

        let record = workflow
            .restock(record_id, returned.quantity(), Some("RMA-7".to_string()), Utc::now())
            .unwrap();
        assert_eq!(record.quantity_on_hand(), 5);
        let movement = record.movements().last().unwrap();
        assert_eq!(movement.originator(), Originator::Return);
        assert_eq!(movement.quantity(), 2);
        assert_eq!(movement.reason(), Some("RMA-7"));

        let err = workflow.return_unit(unit.id_typed(), Utc::now()).unwrap_err();
        assert_eq!(err.rejection(), Some(&InventoryError::AlreadyReturned));

        let err = workflow.restock(record_id, 0, None, Utc::now()).unwrap_err();
        assert!(matches!(
            err.rejection(),
            Some(InventoryError::InvalidQuantity { .. })
        ));
    }

    #[test]
    fn cancelled_reservation_cannot_be_released_twice() {
        let (workflow, _, _) = setup();
        let record_id = register(&workflow, 10, false);
        let req = line(record_id, 4);
        workflow.reserve_line(&req).unwrap();

        let record = workflow
            .cancel_reservation(record_id, req.order_id, 4, Utc::now())
            .unwrap();
        assert_eq!(record.quantity_reserved(), 0);
        assert_eq!(record.outstanding_for(req.order_id), 0);

        let err = workflow
            .cancel_reservation(record_id, req.order_id, 4, Utc::now())
            .unwrap_err();
        assert_eq!(
            err.rejection(),
            Some(&InventoryError::InvalidRelease {
                reserved: 0,
                requested: 4
            })
        );
    }

    #[test]
    fn empty_shipment_is_rejected() {
        let (workflow, _, _) = setup();
        let record_id = register(&workflow, 1, false);
        let err = workflow
            .ship(&ShipUnits {
                record_id,
                order_id: OrderId::new(),
                shipment_id: ShipmentId::new(),
                unit_ids: vec![],
                occurred_at: Utc::now(),
            })
            .unwrap_err();
        assert!(matches!(err, WorkflowError::EmptyShipment { .. }));
    }

    #[test]
    fn projection_worker_follows_the_workflow() {
        let (workflow, _, bus) = setup();
        let levels = SharedStockLevels::new();

        let feed = levels.clone();
        let worker = ProjectionWorker::spawn(
            "stock-levels",
            &bus,
            Some(STOCK_RECORD_AGGREGATE),
            move |env| feed.apply_envelope(&env).map(|_| ()),
        )
        .unwrap();

        let record_id = register(&workflow, 8, false);
        let req = line(record_id, 5);
        workflow.reserve_line(&req).unwrap();
        workflow
            .cancel_reservation(record_id, req.order_id, 2, Utc::now())
            .unwrap();

        // Shutdown drains everything published so far.
        worker.shutdown();

        let view = levels.get(record_id).unwrap();
        assert_eq!((view.on_hand, view.reserved, view.available), (8, 3, 5));
        assert!(!view.deleted);

        let record = workflow.stock_record(record_id).unwrap();
        let found = levels
            .find(record.variant_id(), record.stock_location_id())
            .unwrap();
        assert_eq!(found.record_id, record_id);
    }

    #[test]
    fn rebuilding_the_read_model_from_the_store_matches() {
        let (workflow, store, _) = setup();
        let record_id = register(&workflow, 8, true);
        workflow.reserve_line(&line(record_id, 10)).unwrap();

        let history: Vec<_> = store
            .load_stream(record_id.0)
            .unwrap()
            .iter()
            .map(StoredEvent::to_envelope)
            .collect();
        let levels = SharedStockLevels::new();
        levels.rebuild_from_scratch(history).unwrap();

        let view = levels.get(record_id).unwrap();
        assert_eq!((view.on_hand, view.reserved, view.available), (8, 10, 0));
    }

    /// Store wrapper that lets a competing writer commit right before the next append.
    struct RacingStore {
        inner: Arc<InMemoryEventStore>,
        interfere: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl EventStore for RacingStore {
        fn append(
            &self,
            events: Vec<UncommittedEvent>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            let competitor = self.interfere.lock().unwrap().take();
            if let Some(competitor) = competitor {
                competitor();
            }
            self.inner.append(events, expected_version)
        }

        fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
            self.inner.load_stream(aggregate_id)
        }
    }

    fn make(id: AggregateId) -> StockRecord {
        StockRecord::empty(StockRecordId(id))
    }

    fn reserve(record_id: StockRecordId, quantity: i64, order_id: OrderId) -> StockCommand {
        StockCommand::Reserve(ReserveStock {
            record_id,
            quantity,
            order_id,
            occurred_at: Utc::now(),
        })
    }

    fn racing_setup(
        on_hand: i64,
        competing_quantity: i64,
        retry: RetryPolicy,
    ) -> (CommandDispatcher<RacingStore, Bus>, StockRecordId) {
        let inner = Arc::new(InMemoryEventStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let plain = ReservationWorkflow::new(CommandDispatcher::new(inner.clone(), bus.clone()));
        let record_id = register(&plain, on_hand, false);

        let competitor: Box<dyn FnOnce() + Send> = Box::new(move || {
            plain
                .dispatcher()
                .dispatch(
                    STOCK_RECORD_AGGREGATE,
                    &reserve(record_id, competing_quantity, OrderId::new()),
                    make,
                )
                .unwrap();
        });
        let racing = RacingStore {
            inner,
            interfere: Mutex::new(Some(competitor)),
        };
        let dispatcher = CommandDispatcher::new(racing, bus).with_retry_policy(retry);
        (dispatcher, record_id)
    }

    #[test]
    fn conflict_without_retry_surfaces_as_concurrency() {
        let (dispatcher, record_id) = racing_setup(10, 3, RetryPolicy::no_retry());

        let err = dispatcher
            .dispatch_with_retry(STOCK_RECORD_AGGREGATE, &reserve(record_id, 2, OrderId::new()), make)
            .unwrap_err();
        assert!(err.is_concurrency());

        // Only the competitor's reservation landed.
        let loaded = dispatcher.load(record_id.0, make).unwrap();
        assert_eq!(loaded.aggregate.quantity_reserved(), 3);
    }

    #[test]
    fn conflict_is_retried_against_fresh_state() {
        let (dispatcher, record_id) = racing_setup(10, 3, RetryPolicy::default());

        let out = dispatcher
            .dispatch_with_retry(STOCK_RECORD_AGGREGATE, &reserve(record_id, 2, OrderId::new()), make)
            .unwrap();
        assert_eq!(out.aggregate.quantity_reserved(), 5);
        assert_eq!(out.aggregate.version(), 3);
        assert_eq!(out.aggregate.movements().len(), 2);
    }

    #[test]
    fn retry_re_decides_instead_of_replaying_the_old_delta() {
        // The competitor takes stock the first attempt counted on.
        let (dispatcher, record_id) = racing_setup(10, 7, RetryPolicy::default());

        let err = dispatcher
            .dispatch_with_retry(STOCK_RECORD_AGGREGATE, &reserve(record_id, 5, OrderId::new()), make)
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Rejected(InventoryError::InsufficientStock {
                available: 3,
                requested: 5
            })
        ));
        let loaded = dispatcher.load(record_id.0, make).unwrap();
        assert_eq!(loaded.aggregate.quantity_reserved(), 7);
    }

    #[test]
    fn parallel_reservations_never_oversell() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let config = InfraConfig::from_lookup(|key| match key {
            crate::config::ENV_COMMIT_MAX_ATTEMPTS => Some("200".to_string()),
            _ => None,
        })
        .unwrap();
        let workflow = Arc::new(ReservationWorkflow::new(CommandDispatcher::from_config(
            store.clone(),
            bus,
            &config,
        )));
        let record_id = register(&workflow, 6, false);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let workflow = workflow.clone();
                thread::spawn(move || workflow.reserve_line(&line(record_id, 1)))
            })
            .collect();
        let results: Vec<Result<_, WorkflowError>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded, 6);
        for failure in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(
                failure.rejection(),
                Some(InventoryError::InsufficientStock { .. })
            ));
        }

        let record = workflow.stock_record(record_id).unwrap();
        assert_eq!(record.quantity_reserved(), 6);
        assert_eq!(record.movements().len(), 6);
        assert!(record.validate_invariants().is_ok());
    }

    #[test]
    fn second_line_of_an_order_cannot_reuse_the_first_lines_reservation() {
        let (workflow, store, _) = setup();
        let record_id = register(&workflow, 5, false);
        let first = line(record_id, 4);
        workflow.reserve_line(&first).unwrap();

        let second = ReserveLine {
            line_item_id: LineItemId::new(),
            ..first.clone()
        };
        let err = workflow.reserve_line(&second).unwrap_err();

        match err {
            WorkflowError::LineConflict {
                order_id,
                allocated_line,
                ..
            } => {
                assert_eq!(order_id, first.order_id);
                assert_eq!(allocated_line, first.line_item_id);
            }
            other => panic!("expected a line conflict, got {other:?}"),
        }
        let record = workflow.stock_record(record_id).unwrap();
        assert_eq!(record.quantity_reserved(), 4);
        let on_hand_unit = unit_id(first.order_id, record_id, UnitState::OnHand);
        assert_eq!(stream_len(&store, on_hand_unit.0), 1);
        assert_eq!(
            workflow.inventory_unit(on_hand_unit).unwrap().line_item_id(),
            first.line_item_id
        );
    }

    #[test]
    fn updating_the_pair_cannot_open_a_second_record() {
        let (workflow, _, _) = setup();
        let (variant, location) = (VariantId::new(), StockLocationId::new());
        let register_pair = |variant_id| {
            workflow.register_stock(&RegisterStock {
                variant_id,
                stock_location_id: location,
                sku: "SKU-100".to_string(),
                quantity_on_hand: 1,
                backorderable: false,
                occurred_at: Utc::now(),
            })
        };
        let record_id = register_pair(variant).unwrap().id_typed();

        let mut update = UpdateStockRecord::new(record_id, Utc::now());
        update.variant_id = Some(VariantId::new());
        let err = workflow
            .dispatcher()
            .dispatch(STOCK_RECORD_AGGREGATE, &StockCommand::Update(update), make)
            .unwrap_err();
        assert_eq!(
            err.rejection(),
            Some(&InventoryError::ImmutableField { field: "variant_id" })
        );

        let record = workflow.stock_record(record_id).unwrap();
        assert_eq!(record.variant_id(), variant);
        assert_eq!(record.version(), 1);

        let err = register_pair(variant).unwrap_err();
        assert_eq!(err.rejection(), Some(&InventoryError::AlreadyExists));
    }

    /// Bus that refuses the first publish of one event type, as a broker
    /// outage between two workflow steps would.
    struct FlakyBus {
        inner: Bus,
        fail_on: &'static str,
        armed: AtomicBool,
    }

    impl EventBus<EventEnvelope<JsonValue>> for FlakyBus {
        type Error = String;

        fn publish(&self, message: EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
            if message.event_type() == self.fail_on && self.armed.swap(false, Ordering::SeqCst) {
                return Err("broker down".to_string());
            }
            self.inner.publish(message).map_err(|e| format!("{e:?}"))
        }

        fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
            self.inner.subscribe()
        }
    }

    /// Workflow over a shared store whose bus fails once on `fail_on`, plus a
    /// registered record.
    fn flaky_setup(
        fail_on: &'static str,
        on_hand: i64,
        backorderable: bool,
    ) -> (
        Workflow,
        ReservationWorkflow<Arc<InMemoryEventStore>, FlakyBus>,
        StockRecordId,
    ) {
        let (plain, store, bus) = setup();
        let record_id = register(&plain, on_hand, backorderable);
        let flaky = ReservationWorkflow::new(CommandDispatcher::new(
            store,
            FlakyBus {
                inner: bus,
                fail_on,
                armed: AtomicBool::new(true),
            },
        ));
        (plain, flaky, record_id)
    }

    #[test]
    fn reserve_line_retried_after_failing_past_the_reserve_converges() {
        for fail_on in ["inventory.stock.reserved", "inventory.unit.created"] {
            let (plain, flaky, record_id) = flaky_setup(fail_on, 3, true);
            let req = line(record_id, 5);

            let err = flaky.reserve_line(&req).unwrap_err();
            assert!(matches!(
                err,
                WorkflowError::Dispatch(DispatchError::Publish(_))
            ));
            // The reservation is committed even though the call failed.
            assert_eq!(plain.stock_record(record_id).unwrap().quantity_reserved(), 5);

            let reservation = flaky.reserve_line(&req).unwrap();
            assert_eq!(reservation.record.quantity_reserved(), 5);
            assert_eq!(reservation.record.movements().len(), 1);
            assert_eq!(reservation.on_hand.as_ref().unwrap().quantity(), 3);
            assert_eq!(reservation.backordered.as_ref().unwrap().quantity(), 2);
        }
    }

    #[test]
    fn ship_retried_after_failing_past_the_confirmation_converges() {
        let (plain, flaky, record_id) = flaky_setup("inventory.unit.location_assigned", 10, false);
        let req = line(record_id, 3);
        let unit = plain.reserve_line(&req).unwrap().on_hand.unwrap();
        let ship = ShipUnits {
            record_id,
            order_id: req.order_id,
            shipment_id: req.shipment_id,
            unit_ids: vec![unit.id_typed()],
            occurred_at: Utc::now(),
        };

        let err = flaky.ship(&ship).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Dispatch(DispatchError::Publish(_))
        ));
        // Sold on the record, unit still waiting.
        assert_eq!(plain.stock_record(record_id).unwrap().quantity_on_hand(), 7);
        assert_eq!(plain.inventory_unit(unit.id_typed()).unwrap().state(), UnitState::OnHand);

        let shipment = flaky.ship(&ship).unwrap();
        assert_eq!(shipment.record.quantity_on_hand(), 7);
        assert_eq!(shipment.record.quantity_reserved(), 0);
        let sold: Vec<_> = shipment
            .record
            .movements()
            .iter()
            .filter(|m| m.action() == MovementAction::Sold)
            .collect();
        assert_eq!(sold.len(), 1);
        assert_eq!(shipment.units.len(), 1);
        assert!(shipment.units[0].is_shipped());
        assert_eq!(
            shipment.units[0].stock_location_id(),
            Some(shipment.record.stock_location_id())
        );
    }

    #[test]
    fn resumed_shipment_must_cover_the_confirmed_quantity() {
        let (plain, flaky, record_id) = flaky_setup("inventory.unit.location_assigned", 1, true);
        let req = line(record_id, 3);
        let reservation = plain.reserve_line(&req).unwrap();
        let on_hand = reservation.on_hand.unwrap().id_typed();
        let backordered = reservation.backordered.unwrap().id_typed();
        let ship = |unit_ids| ShipUnits {
            record_id,
            order_id: req.order_id,
            shipment_id: req.shipment_id,
            unit_ids,
            occurred_at: Utc::now(),
        };

        flaky.ship(&ship(vec![on_hand])).unwrap_err();

        let receive = StockCommand::Adjust(AdjustStock {
            record_id,
            delta: 2,
            originator: Originator::System,
            reason: None,
            occurred_at: Utc::now(),
        });
        plain
            .dispatcher()
            .dispatch(STOCK_RECORD_AGGREGATE, &receive, make)
            .unwrap();
        plain.fill_backorder(backordered, Utc::now()).unwrap();

        // The shipment already sold 1; a retry may not grow it to 3.
        let err = flaky.ship(&ship(vec![on_hand, backordered])).unwrap_err();
        match err {
            WorkflowError::ShipmentMismatch {
                confirmed,
                requested,
                ..
            } => assert_eq!((confirmed, requested), (1, 3)),
            other => panic!("expected a shipment mismatch, got {other:?}"),
        }
        let record = plain.stock_record(record_id).unwrap();
        assert_eq!(record.quantity_on_hand(), 2);
        assert_eq!(record.quantity_reserved(), 2);

        let shipment = flaky.ship(&ship(vec![on_hand])).unwrap();
        assert!(shipment.units[0].is_shipped());
        assert_eq!(shipment.record.quantity_on_hand(), 2);
    }
}
