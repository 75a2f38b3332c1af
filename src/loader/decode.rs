//! Decoding staged payloads into Arrow record batches.
//!
//! CSV payloads are read by header name: a known layout (the declared schema,
//! or the destination table's) supplies the type of each header column,
//! otherwise types are inferred by sampling values. NDJSON payloads use
//! Arrow's JSON reader with a known or inferred layout. Inferred timestamps
//! are coerced to UTC microseconds, the only timestamp representation Delta
//! tables store. Columns that are null in every sampled record stay
//! [`DataType::Null`] so they fit any nullable column.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use deltalake::arrow::array::RecordBatch;
use deltalake::arrow::csv::ReaderBuilder as CsvReaderBuilder;
use deltalake::arrow::csv::reader::Format;
use deltalake::arrow::datatypes::{DataType, Field, FieldRef, Schema, SchemaRef, TimeUnit};
use deltalake::arrow::json::ReaderBuilder as JsonReaderBuilder;
use deltalake::arrow::json::reader::infer_json_schema;
use tracing::debug;

use crate::error::LoadError;
use crate::serialize::PayloadFormat;

/// Records sampled when inferring a schema.
const SAMPLE_SIZE: usize = 1000;

const BATCH_SIZE: usize = 8192;

/// A staged payload decoded against its schema.
#[derive(Debug, Clone)]
pub struct DecodedPayload {
    /// Layout of the payload in column order.
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub num_rows: usize,
}

/// Decode a whole payload.
///
/// `layout` is the schema to read against; without one the schema is
/// inferred. Any malformed value fails the whole payload; nothing is
/// partially loaded.
pub fn decode_payload(
    bytes: &Bytes,
    format: PayloadFormat,
    layout: Option<&SchemaRef>,
    table: &str,
) -> Result<DecodedPayload, LoadError> {
    let schema = match (format, layout) {
        (PayloadFormat::Csv, Some(layout)) => csv_schema_from_header(bytes, layout, table)?,
        (PayloadFormat::Csv, None) => infer_csv_schema(bytes, table)?,
        (PayloadFormat::NewlineDelimitedJson, Some(layout)) => Arc::clone(layout),
        (PayloadFormat::NewlineDelimitedJson, None) => infer_ndjson_schema(bytes, table)?,
    };

    let batches = match format {
        PayloadFormat::Csv => read_csv(bytes, &schema, table)?,
        PayloadFormat::NewlineDelimitedJson => {
            read_ndjson(bytes, &schema, layout.is_some(), table)?
        }
    };
    let num_rows = batches.iter().map(RecordBatch::num_rows).sum();

    debug!(
        table,
        format = %format,
        columns = schema.fields().len(),
        rows = num_rows,
        "Decoded staged payload"
    );

    Ok(DecodedPayload {
        schema,
        batches,
        num_rows,
    })
}

/// Order the layout's fields the way the CSV header lists them.
fn csv_schema_from_header(
    bytes: &Bytes,
    layout: &SchemaRef,
    table: &str,
) -> Result<SchemaRef, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes.as_ref());
    let header = reader.headers().map_err(|e| decode_error(table, e))?;

    let mut fields = Vec::with_capacity(header.len());
    let mut undeclared = Vec::new();
    for name in header {
        match layout.field_with_name(name) {
            Ok(field) => fields.push(field.clone()),
            Err(_) => undeclared.push(format!("column '{name}' does not exist in the table")),
        }
    }

    if !undeclared.is_empty() {
        return Err(LoadError::SchemaMismatch {
            table: table.to_string(),
            details: undeclared.join("; "),
        });
    }

    Ok(Arc::new(Schema::new(fields)))
}

fn infer_csv_schema(bytes: &Bytes, table: &str) -> Result<SchemaRef, LoadError> {
    let (schema, records_read) = Format::default()
        .with_header(true)
        .infer_schema(Cursor::new(bytes.as_ref()), Some(SAMPLE_SIZE))
        .map_err(|e| decode_error(table, e))?;

    if records_read == 0 {
        return Err(LoadError::EmptyPayload {
            table: table.to_string(),
        });
    }

    Ok(coerce_schema(&schema))
}

fn infer_ndjson_schema(bytes: &Bytes, table: &str) -> Result<SchemaRef, LoadError> {
    let (schema, records_read) = infer_json_schema(Cursor::new(bytes.as_ref()), Some(SAMPLE_SIZE))
        .map_err(|e| decode_error(table, e))?;

    if records_read == 0 {
        return Err(LoadError::EmptyPayload {
            table: table.to_string(),
        });
    }

    Ok(coerce_schema(&schema))
}

fn read_csv(bytes: &Bytes, schema: &SchemaRef, table: &str) -> Result<Vec<RecordBatch>, LoadError> {
    CsvReaderBuilder::new(Arc::clone(schema))
        .with_header(true)
        .with_batch_size(BATCH_SIZE)
        .build(Cursor::new(bytes.as_ref()))
        .map_err(|e| decode_error(table, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| mismatch(table, e))
}

fn read_ndjson(
    bytes: &Bytes,
    schema: &SchemaRef,
    strict: bool,
    table: &str,
) -> Result<Vec<RecordBatch>, LoadError> {
    JsonReaderBuilder::new(Arc::clone(schema))
        .with_batch_size(BATCH_SIZE)
        .with_strict_mode(strict)
        .build(Cursor::new(bytes.as_ref()))
        .map_err(|e| decode_error(table, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| mismatch(table, e))
}

/// Coerce inferred types to what a Delta table can store.
fn coerce_schema(schema: &Schema) -> SchemaRef {
    let fields: Vec<FieldRef> = schema
        .fields()
        .iter()
        .map(|field| match field.data_type() {
            DataType::Timestamp(_, _) => Arc::new(Field::new(
                field.name(),
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                field.is_nullable(),
            )),
            DataType::Null => Arc::new(Field::new(field.name(), DataType::Null, true)),
            _ => Arc::clone(field),
        })
        .collect();

    Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()))
}

fn decode_error(table: &str, error: impl std::fmt::Display) -> LoadError {
    LoadError::Decode {
        table: table.to_string(),
        message: error.to_string(),
    }
}

// A value that does not fit its column is a layout problem, not a transport one.
fn mismatch(table: &str, error: impl std::fmt::Display) -> LoadError {
    LoadError::SchemaMismatch {
        table: table.to_string(),
        details: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltalake::arrow::array::{Array, Int64Array, StringArray};

    fn trip_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("fromProvinceId", DataType::Int64, true),
            Field::new("departureDate", DataType::Date32, true),
            Field::new(
                "searchTimestamp",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                true,
            ),
            Field::new("userId", DataType::Utf8, true),
        ]))
    }

    #[test]
    fn test_infer_csv_types() {
        let bytes = Bytes::from_static(
            b"id,price,createdAt,note\n\
              1,150000.0,2025-06-26 08:30:00.250000,\n\
              2,99.5,2025-06-26 09:00:00+00:00,late\n",
        );
        let decoded = decode_payload(&bytes, PayloadFormat::Csv, None, "p.d.ticket").unwrap();

        assert_eq!(decoded.num_rows, 2);
        let types: Vec<&DataType> = decoded
            .schema
            .fields()
            .iter()
            .map(|f| f.data_type())
            .collect();
        assert_eq!(
            types,
            vec![
                &DataType::Int64,
                &DataType::Float64,
                &DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                &DataType::Utf8,
            ]
        );
        assert_eq!(decoded.batches[0].column(3).null_count(), 1);
    }

    #[test]
    fn test_csv_declared_schema_follows_header_order() {
        let bytes = Bytes::from_static(b"userId,fromProvinceId\nu1,1\nu2,\n");
        let decoded =
            decode_payload(&bytes, PayloadFormat::Csv, Some(&trip_schema()), "t").unwrap();

        assert_eq!(decoded.schema.field(0).name(), "userId");
        let ids = decoded.batches[0]
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(ids.value(0), 1);
        assert!(ids.is_null(1));
    }

    #[test]
    fn test_csv_undeclared_column_is_mismatch() {
        let bytes = Bytes::from_static(b"userId,extra\nu1,x\n");
        let err =
            decode_payload(&bytes, PayloadFormat::Csv, Some(&trip_schema()), "t").unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_csv_bad_value_is_mismatch() {
        let bytes = Bytes::from_static(b"fromProvinceId\nnot-a-number\n");
        let err =
            decode_payload(&bytes, PayloadFormat::Csv, Some(&trip_schema()), "t").unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_ndjson_declared_schema() {
        let bytes = Bytes::from(
            [
                r#"{"fromProvinceId":1,"departureDate":"2025-06-27","searchTimestamp":"2025-06-26T10:15:00Z","userId":"u1"}"#,
                r#"{"fromProvinceId":2,"userId":"u2"}"#,
            ]
            .join("\n"),
        );
        let decoded = decode_payload(
            &bytes,
            PayloadFormat::NewlineDelimitedJson,
            Some(&trip_schema()),
            "t",
        )
        .unwrap();

        assert_eq!(decoded.num_rows, 2);
        let batch = &decoded.batches[0];
        assert_eq!(batch.column(2).null_count(), 1);
        let users = batch
            .column(3)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(users.value(1), "u2");
    }

    #[test]
    fn test_ndjson_unknown_field_rejected_with_declared_schema() {
        let bytes = Bytes::from_static(br#"{"fromProvinceId":1,"surprise":true}"#);
        let err = decode_payload(
            &bytes,
            PayloadFormat::NewlineDelimitedJson,
            Some(&trip_schema()),
            "t",
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_ndjson_inferred() {
        let bytes = Bytes::from_static(b"{\"a\":1,\"b\":\"x\"}\n{\"a\":2,\"b\":null}");
        let decoded =
            decode_payload(&bytes, PayloadFormat::NewlineDelimitedJson, None, "t").unwrap();
        assert_eq!(decoded.num_rows, 2);
        assert_eq!(
            decoded.schema.field_with_name("a").unwrap().data_type(),
            &DataType::Int64
        );
    }

    #[test]
    fn test_empty_payload_cannot_be_inferred() {
        let bytes = Bytes::from_static(b"id,name\n");
        let err = decode_payload(&bytes, PayloadFormat::Csv, None, "t").unwrap_err();
        assert!(matches!(err, LoadError::EmptyPayload { .. }));
    }

    #[test]
    fn test_all_null_column_stays_untyped() {
        let bytes = Bytes::from_static(b"id,qty\n2,\n3,\n");
        let decoded = decode_payload(&bytes, PayloadFormat::Csv, None, "t").unwrap();

        let qty = decoded.schema.field_with_name("qty").unwrap();
        assert_eq!(qty.data_type(), &DataType::Null);
        assert!(qty.is_nullable());
        assert_eq!(decoded.batches[0].column(1).len(), 2);
    }

    #[test]
    fn test_table_layout_beats_inference() {
        let layout: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("price", DataType::Float64, true),
        ]));
        let bytes = Bytes::from_static(b"price,id\n150000,1\n");
        let decoded = decode_payload(&bytes, PayloadFormat::Csv, Some(&layout), "t").unwrap();
        assert_eq!(
            decoded.schema.field_with_name("price").unwrap().data_type(),
            &DataType::Float64
        );
    }
}
