//! Canonical staging formats.
//!
//! Window extracts become comma-delimited text with a header row. Stream
//! batches become newline-delimited JSON objects. Both encoders are
//! deterministic: the same rows in the same order produce the same bytes.

use bytes::Bytes;
use chrono::{NaiveDateTime, Timelike};
use serde_json::{Map, Value};
use snafu::prelude::*;
use std::fmt;

use crate::error::{CsvSnafu, JsonEncodeSnafu, SerializeError};
use crate::source::{RowSet, Scalar};

/// Staging payload format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// Comma-delimited text; the first line is the header.
    Csv,
    /// One JSON object per line.
    NewlineDelimitedJson,
}

impl PayloadFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            PayloadFormat::Csv => "csv",
            PayloadFormat::NewlineDelimitedJson => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            PayloadFormat::Csv => "text/csv",
            PayloadFormat::NewlineDelimitedJson => "application/json",
        }
    }

    /// Leading lines that are not data.
    pub fn skip_leading_rows(&self) -> usize {
        match self {
            PayloadFormat::Csv => 1,
            PayloadFormat::NewlineDelimitedJson => 0,
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadFormat::Csv => write!(f, "CSV"),
            PayloadFormat::NewlineDelimitedJson => write!(f, "NEWLINE_DELIMITED_JSON"),
        }
    }
}

/// Encode a row set as CSV with a header row of column names.
pub fn serialize_rows(rows: &RowSet) -> Result<Bytes, SerializeError> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer.write_record(rows.columns()).context(CsvSnafu)?;
    for row in rows.rows() {
        writer
            .write_record(row.iter().map(render_scalar))
            .context(CsvSnafu)?;
    }

    let buffer = writer
        .into_inner()
        .map_err(|e| SerializeError::CsvFlush {
            message: e.error().to_string(),
        })?;
    Ok(Bytes::from(buffer))
}

/// Encode decoded stream records as newline-delimited JSON.
///
/// Lines are joined by `\n` with no trailing newline.
pub fn serialize_records(records: &[Map<String, Value>]) -> Result<Bytes, SerializeError> {
    let lines = records
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()
        .context(JsonEncodeSnafu)?;
    Ok(Bytes::from(lines.join("\n")))
}

/// Text form of a value inside a CSV field.
fn render_scalar(value: &Scalar) -> String {
    match value {
        Scalar::Null => String::new(),
        Scalar::Int(v) => v.to_string(),
        Scalar::Float(v) => render_float(*v),
        Scalar::Bool(v) => v.to_string(),
        Scalar::Text(v) | Scalar::Numeric(v) => v.clone(),
        Scalar::Date(v) => v.format("%Y-%m-%d").to_string(),
        Scalar::Timestamp(v) => render_timestamp(v),
        Scalar::TimestampTz(v) => format!("{}+00:00", render_timestamp(&v.naive_utc())),
    }
}

// Integral floats keep a fractional part so the column stays floating point.
fn render_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if v.fract() == 0.0 {
        format!("{v:.1}")
    } else {
        v.to_string()
    }
}

fn render_timestamp(v: &NaiveDateTime) -> String {
    if v.nanosecond() == 0 {
        v.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        v.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
    }
}
