use async_trait::async_trait;

use super::{ExtractionWindow, RowSet};
use crate::error::SourceError;

/// A queryable relational store.
///
/// Implementations open whatever connection they need for the call and
/// release it before returning.
#[async_trait]
pub trait RelationalSource: Send + Sync {
    /// Identity used in logs and errors.
    fn id(&self) -> &str;

    /// Run the window's single bounded query and return every matching row.
    async fn query_window(&self, window: &ExtractionWindow) -> Result<RowSet, SourceError>;
}
