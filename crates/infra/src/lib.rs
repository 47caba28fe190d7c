//! Infrastructure layer: event store, command dispatch, workflows, read models
//! and configuration.

pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod projections;
pub mod workers;
pub mod workflow;

pub use command_dispatcher::{CommandDispatcher, DispatchError, Dispatched, Loaded};
pub use config::{ConfigError, InfraConfig, RetryPolicy};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent};
pub use projections::{SharedStockLevels, StockLevelsProjection, StockLevelsView};
pub use workers::{ProjectionWorker, WorkerHandle};
pub use workflow::{
    LineReservation, RegisterStock, ReservationWorkflow, ReserveLine, ShipUnits, Shipment,
    WorkflowError,
};

#[cfg(test)]
mod integration_tests;
