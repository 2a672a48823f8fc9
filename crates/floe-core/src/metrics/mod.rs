//! Metrics infrastructure shared by floe binaries and libraries.
//!
//! - `events`: the `InternalEvent` trait and storage-level events
//! - `server`: Prometheus recorder and the HTTP exporter

pub mod events;
pub mod server;

pub use server::{init_global, init_test};

/// Emit an [`events::InternalEvent`], recording its metrics.
///
/// ```ignore
/// use floe_core::emit;
/// use floe_core::metrics::events::{RequestStatus, StorageOperation, StorageRequest};
///
/// emit!(StorageRequest { operation: StorageOperation::Get, status: RequestStatus::Success });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
