//! Process-wide tracing setup shared by binaries and test harnesses.

pub mod subscriber;

pub use subscriber::{DEFAULT_FILTER, init, init_for_tests};
