//! Time-windowed extraction from relational sources.
//!
//! An [`ExtractionWindow`] names a table, its time column and a half-open
//! interval. [`extract`] runs exactly one bounded query for the window through
//! a [`RelationalSource`] and reports either the rows or that the window was
//! empty.

mod postgres;
mod row;
mod traits;
mod window;

pub use postgres::PostgresSource;
pub use row::{RowSet, Scalar};
pub use traits::RelationalSource;
pub use window::{ExtractionWindow, Extracted, extract};
