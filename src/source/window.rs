use chrono::{DateTime, Utc};
use regex::Regex;
use snafu::prelude::*;
use std::fmt;
use std::sync::LazyLock;
use std::time::Instant;
use tracing::{debug, info};

use super::{RelationalSource, RowSet};
use crate::emit;
use crate::error::{ConfigError, InvalidIdentifierSnafu, InvalidWindowSnafu, SourceError};
use crate::metrics::events::{Stage, StageCompleted};

/// Plain SQL identifiers only. They are placed into the query unquoted so the
/// source's own case folding applies.
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("identifier pattern is valid"));

/// A half-open `[start, end)` slice of one table, keyed by a time column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionWindow {
    source_id: String,
    schema: String,
    table: String,
    time_column: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl ExtractionWindow {
    pub fn new(
        source_id: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
        time_column: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        ensure!(
            start < end,
            InvalidWindowSnafu {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            }
        );

        let schema = schema.into();
        let table = table.into();
        let time_column = time_column.into();
        for (kind, value) in [
            ("schema", &schema),
            ("table", &table),
            ("column", &time_column),
        ] {
            ensure!(
                IDENTIFIER.is_match(value),
                InvalidIdentifierSnafu { kind, value }
            );
        }

        Ok(Self {
            source_id: source_id.into(),
            schema,
            table,
            time_column,
            start,
            end,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn time_column(&self) -> &str {
        &self.time_column
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// `schema.table`, unquoted.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// The single query issued for this window. Bounds are `$1` and `$2`.
    pub fn sql(&self) -> String {
        format!(
            "SELECT * FROM {} WHERE {col} >= $1::timestamptz AND {col} < $2::timestamptz",
            self.qualified_table(),
            col = self.time_column,
        )
    }
}

impl fmt::Display for ExtractionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} [{}, {})",
            self.source_id,
            self.qualified_table(),
            self.start.to_rfc3339(),
            self.end.to_rfc3339()
        )
    }
}

/// Result of extracting one window.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Rows(RowSet),
    Empty,
}

/// Extract one window. Zero rows is [`Extracted::Empty`], not an error.
pub async fn extract(
    source: &dyn RelationalSource,
    window: &ExtractionWindow,
) -> Result<Extracted, SourceError> {
    let start = Instant::now();
    debug!(source = source.id(), sql = %window.sql(), "Querying window");

    let rows = source.query_window(window).await?;

    emit!(StageCompleted {
        stage: Stage::Extract,
        duration: start.elapsed(),
    });

    if rows.is_empty() {
        info!(window = %window, "Window is empty");
        return Ok(Extracted::Empty);
    }

    info!(
        window = %window,
        rows = rows.len(),
        columns = rows.columns().len(),
        "Extracted window"
    );
    Ok(Extracted::Rows(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Scalar;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct FixedSource {
        rows: RowSet,
    }

    #[async_trait]
    impl RelationalSource for FixedSource {
        fn id(&self) -> &str {
            "fixed"
        }

        async fn query_window(&self, _window: &ExtractionWindow) -> Result<RowSet, SourceError> {
            Ok(self.rows.clone())
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, d, 0, 0, 0).unwrap()
    }

    fn window() -> ExtractionWindow {
        ExtractionWindow::new("ticket_db", "public", "Ticket", "createdAt", day(26), day(27))
            .unwrap()
    }

    #[test]
    fn test_sql_is_unquoted_and_parameterized() {
        assert_eq!(
            window().sql(),
            "SELECT * FROM public.Ticket WHERE createdAt >= $1::timestamptz AND createdAt < $2::timestamptz"
        );
    }

    #[test]
    fn test_rejects_unordered_bounds() {
        let err = ExtractionWindow::new("db", "public", "t", "ts", day(27), day(26)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWindow { .. }));

        let err = ExtractionWindow::new("db", "public", "t", "ts", day(26), day(26)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWindow { .. }));
    }

    #[test]
    fn test_rejects_non_identifiers() {
        let err = ExtractionWindow::new("db", "public", "t; DROP TABLE x", "ts", day(26), day(27))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIdentifier { .. }));
    }

    #[tokio::test]
    async fn test_extract_empty() {
        let source = FixedSource {
            rows: RowSet::new(vec!["id".to_string()]),
        };
        let result = extract(&source, &window()).await.unwrap();
        assert_eq!(result, Extracted::Empty);
    }

    #[tokio::test]
    async fn test_extract_rows() {
        let mut rows = RowSet::new(vec!["id".to_string()]);
        rows.push(vec![Scalar::Int(1)]).unwrap();
        let source = FixedSource { rows };

        match extract(&source, &window()).await.unwrap() {
            Extracted::Rows(rows) => assert_eq!(rows.len(), 1),
            Extracted::Empty => panic!("expected rows"),
        }
    }
}
