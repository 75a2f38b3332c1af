//! Metrics and observability infrastructure for rivulet.
//!
//! This module groups all observability-related components:
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus HTTP server and initialization

pub mod events;
pub mod server;

// Re-export commonly used items
pub use server::init;

/// Emit an internal event.
///
/// This macro calls the `InternalEvent::emit()` method on the given event,
/// which records the corresponding Prometheus metric.
///
/// # Example
///
/// ```ignore
/// use rivulet::metrics::events::{RowsExtracted, ObjectStaged};
///
/// emit!(RowsExtracted {
///     pipeline: "tickets".to_string(),
///     count: 3,
/// });
/// emit!(ObjectStaged { bytes: 1024 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
