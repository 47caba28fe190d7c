//! Aggregate contract, typed identifiers and the shared error type used by the
//! stockroom domain and infrastructure crates.

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::Entity;
pub use error::DomainError;
pub use id::{AggregateId, LineItemId, OrderId, ShipmentId, StockLocationId, VariantId};
pub use value_object::ValueObject;
