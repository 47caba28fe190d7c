//! Workflows that coordinate more than one aggregate.
//!
//! Aggregates never call each other; the ordering between them lives here.

pub mod reservation;

pub use reservation::{
    LineReservation, RegisterStock, ReservationWorkflow, ReserveLine, ShipUnits, Shipment,
    WorkflowError, stock_record_id, unit_id,
};
