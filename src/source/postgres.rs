//! PostgreSQL relational source.
//!
//! Each call opens its own connection, runs one query and closes the
//! connection again before returning. Column values are mapped to [`Scalar`]
//! by the column's declared type. Types without a native mapping, NUMERIC
//! included, are cast to `text` by the server and kept in that form.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use snafu::prelude::*;
use std::error::Error;
use tokio::task::JoinHandle;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ExtractionWindow, RelationalSource, RowSet, Scalar};
use crate::error::{ConnectivitySnafu, SourceError, UnsupportedTypeSnafu};

/// A PostgreSQL database reached by connection URL.
#[derive(Clone)]
pub struct PostgresSource {
    id: String,
    url: String,
}

impl std::fmt::Debug for PostgresSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The URL carries credentials.
        write!(f, "PostgresSource<{}>", self.id)
    }
}

impl PostgresSource {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }

    async fn connect(&self) -> Result<(Client, ConnectionTask), SourceError> {
        let (client, connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .context(ConnectivitySnafu {
                source_id: &self.id,
            })?;

        let id = self.id.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(source = %id, error = %e, "Connection closed with error");
            }
        });

        Ok((client, ConnectionTask(task)))
    }

    fn query_error(&self, error: tokio_postgres::Error) -> SourceError {
        match error.as_db_error() {
            Some(db_error) => SourceError::Query {
                source_id: self.id.clone(),
                message: format!("{} ({})", db_error.message(), db_error.code().code()),
            },
            None => SourceError::Connectivity {
                source_id: self.id.clone(),
                source: error,
            },
        }
    }
}

/// Aborts the connection driver when the extraction returns.
struct ConnectionTask(JoinHandle<()>);

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl RelationalSource for PostgresSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn query_window(&self, window: &ExtractionWindow) -> Result<RowSet, SourceError> {
        let (client, _task) = self.connect().await?;

        // Bounds are instants; comparisons against timestamp-without-zone
        // columns must happen in UTC.
        client
            .batch_execute("SET TIME ZONE 'UTC'")
            .await
            .map_err(|e| self.query_error(e))?;

        let statement = client
            .prepare(&window.sql())
            .await
            .map_err(|e| self.query_error(e))?;

        let columns: Vec<(String, ColumnKind)> = statement
            .columns()
            .iter()
            .map(|c| {
                let kind = ColumnKind::for_type(c.type_()).context(UnsupportedTypeSnafu {
                    source_id: &self.id,
                    column: c.name(),
                    type_name: c.type_().name(),
                })?;
                Ok((c.name().to_string(), kind))
            })
            .collect::<Result<_, SourceError>>()?;

        let statement = if columns.iter().any(|(_, kind)| kind.reads_text_form()) {
            client
                .prepare(&text_projection(&window.sql(), &columns))
                .await
                .map_err(|e| self.query_error(e))?
        } else {
            statement
        };

        let start = window.start();
        let end = window.end();
        let rows = client
            .query(&statement, &[&start, &end])
            .await
            .map_err(|e| self.query_error(e))?;

        debug!(source = %self.id, rows = rows.len(), "Query returned");

        let mut row_set = RowSet::new(columns.iter().map(|(name, _)| name.clone()).collect());
        for row in &rows {
            let values = columns
                .iter()
                .enumerate()
                .map(|(idx, (_, kind))| kind.read(row, idx))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| self.query_error(e))?;
            row_set.push(values)?;
        }

        Ok(row_set)
    }
}

/// How a column's values are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    /// Exact decimal, rendered by the server.
    Numeric,
    Text,
    Date,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    /// Any other type, rendered by the server (`time`, `interval`, `inet`,
    /// `bytea`, arrays, ...).
    Rendered,
}

impl ColumnKind {
    fn for_type(ty: &Type) -> Option<Self> {
        let kind = match *ty {
            Type::BOOL => ColumnKind::Bool,
            Type::INT2 => ColumnKind::Int2,
            Type::INT4 => ColumnKind::Int4,
            Type::INT8 => ColumnKind::Int8,
            Type::FLOAT4 => ColumnKind::Float4,
            Type::FLOAT8 => ColumnKind::Float8,
            Type::NUMERIC => ColumnKind::Numeric,
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => ColumnKind::Text,
            Type::DATE => ColumnKind::Date,
            Type::TIMESTAMP => ColumnKind::Timestamp,
            Type::TIMESTAMPTZ => ColumnKind::TimestampTz,
            Type::UUID => ColumnKind::Uuid,
            Type::JSON | Type::JSONB => ColumnKind::Json,
            _ if matches!(ty.kind(), Kind::Enum(_)) => ColumnKind::Text,
            _ if matches!(ty.kind(), Kind::Pseudo) => return None,
            _ => ColumnKind::Rendered,
        };
        Some(kind)
    }

    fn reads_text_form(self) -> bool {
        matches!(self, ColumnKind::Numeric | ColumnKind::Rendered)
    }

    fn read(self, row: &Row, idx: usize) -> Result<Scalar, tokio_postgres::Error> {
        let value = match self {
            ColumnKind::Bool => row.try_get::<_, Option<bool>>(idx)?.into(),
            ColumnKind::Int2 => row.try_get::<_, Option<i16>>(idx)?.map(i64::from).into(),
            ColumnKind::Int4 => row.try_get::<_, Option<i32>>(idx)?.map(i64::from).into(),
            ColumnKind::Int8 => row.try_get::<_, Option<i64>>(idx)?.into(),
            ColumnKind::Float4 => row.try_get::<_, Option<f32>>(idx)?.map(f64::from).into(),
            ColumnKind::Float8 => row.try_get::<_, Option<f64>>(idx)?.into(),
            ColumnKind::Numeric => row
                .try_get::<_, Option<String>>(idx)?
                .map_or(Scalar::Null, Scalar::Numeric),
            ColumnKind::Text => row.try_get::<_, Option<PgText>>(idx)?.map(|t| t.0).into(),
            ColumnKind::Date => row
                .try_get::<_, Option<NaiveDate>>(idx)?
                .map_or(Scalar::Null, Scalar::Date),
            ColumnKind::Timestamp => row
                .try_get::<_, Option<NaiveDateTime>>(idx)?
                .map_or(Scalar::Null, Scalar::Timestamp),
            ColumnKind::TimestampTz => row
                .try_get::<_, Option<DateTime<Utc>>>(idx)?
                .map_or(Scalar::Null, Scalar::TimestampTz),
            ColumnKind::Uuid => row
                .try_get::<_, Option<Uuid>>(idx)?
                .map(|u| u.hyphenated().to_string())
                .into(),
            ColumnKind::Json => row
                .try_get::<_, Option<serde_json::Value>>(idx)?
                .map(|v| v.to_string())
                .into(),
            ColumnKind::Rendered => row.try_get::<_, Option<String>>(idx)?.into(),
        };
        Ok(value)
    }
}

type BoxError = Box<dyn Error + Sync + Send>;

/// Text-like values, including user-defined enums.
struct PgText(String);

impl<'a> FromSql<'a> for PgText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(PgText(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.kind(), Kind::Enum(_)) || <String as FromSql<'_>>::accepts(ty)
    }
}

/// Wrap `base` so that every column read through its text form is cast to
/// `text` by the server.
fn text_projection(base: &str, columns: &[(String, ColumnKind)]) -> String {
    let select = columns
        .iter()
        .map(|(name, kind)| {
            let quoted = quote_ident(name);
            if kind.reads_text_form() {
                format!("{quoted}::text AS {quoted}")
            } else {
                quoted
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {select} FROM ({base}) AS window_rows")
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
