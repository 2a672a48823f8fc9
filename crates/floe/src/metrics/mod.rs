//! Metrics for the upsert sink.
//!
//! Sink events implement [`floe_core::metrics::events::InternalEvent`] and are
//! recorded with [`floe_core::emit!`]. Every event carries a `table` label.

pub mod events;

pub use events::*;
