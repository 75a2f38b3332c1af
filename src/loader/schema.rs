//! Compatibility between a staged payload and an existing table.
//!
//! Loads never evolve a table. A payload is accepted when every staged
//! column exists in the table with the same type or a widening of it, and
//! every table column the payload lacks is nullable. Accepted batches are
//! then aligned to the table layout before the write.

use std::sync::Arc;

use deltalake::arrow::array::{ArrayRef, RecordBatch, new_null_array};
use deltalake::arrow::compute::cast;
use deltalake::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};

/// A column that prevents the payload from being appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incompatibility {
    /// Staged column is not part of the table.
    UnknownColumn { name: String },
    /// Staged type cannot be stored in the table column.
    TypeMismatch {
        name: String,
        staged: DataType,
        table: DataType,
    },
    /// Table column is absent from the payload and does not accept nulls.
    MissingRequired { name: String },
}

impl Incompatibility {
    pub fn column(&self) -> &str {
        match self {
            Incompatibility::UnknownColumn { name }
            | Incompatibility::TypeMismatch { name, .. }
            | Incompatibility::MissingRequired { name } => name,
        }
    }
}

impl std::fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Incompatibility::UnknownColumn { name } => {
                write!(f, "column '{name}' does not exist in the table")
            }
            Incompatibility::TypeMismatch {
                name,
                staged,
                table,
            } => write!(f, "column '{name}' is {staged} but the table has {table}"),
            Incompatibility::MissingRequired { name } => {
                write!(f, "required column '{name}' is missing from the payload")
            }
        }
    }
}

/// Check a staged schema against a table schema.
///
/// Returns every offending column, in staged order followed by table order.
pub fn check_compatible(staged: &Schema, table: &Schema) -> Result<(), Vec<Incompatibility>> {
    let mut problems = Vec::new();

    for field in staged.fields() {
        match table.field_with_name(field.name()) {
            // An untyped (all-null) column fits any column that accepts nulls.
            Ok(target) if field.data_type() == &DataType::Null => {
                if !target.is_nullable() {
                    problems.push(Incompatibility::TypeMismatch {
                        name: field.name().clone(),
                        staged: DataType::Null,
                        table: target.data_type().clone(),
                    });
                }
            }
            Ok(target) => {
                if !is_assignable(field.data_type(), target.data_type()) {
                    problems.push(Incompatibility::TypeMismatch {
                        name: field.name().clone(),
                        staged: field.data_type().clone(),
                        table: target.data_type().clone(),
                    });
                }
            }
            Err(_) => problems.push(Incompatibility::UnknownColumn {
                name: field.name().clone(),
            }),
        }
    }

    for field in table.fields() {
        if !field.is_nullable() && staged.field_with_name(field.name()).is_err() {
            problems.push(Incompatibility::MissingRequired {
                name: field.name().clone(),
            });
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

/// Render a list of problems for an error message.
pub fn describe(problems: &[Incompatibility]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Whether values of `staged` can be written into a column of type `table`.
pub fn is_assignable(staged: &DataType, table: &DataType) -> bool {
    staged == table || (is_string(staged) && is_string(table)) || is_type_widening(staged, table)
}

fn is_string(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View
    )
}

/// Lossless widenings accepted on load.
fn is_type_widening(from: &DataType, to: &DataType) -> bool {
    use DataType::*;

    match (from, to) {
        (Int8, Int16 | Int32 | Int64) => true,
        (Int16, Int32 | Int64) => true,
        (Int32, Int64) => true,
        (Int8 | Int16 | Int32, Float64) => true,
        (Float32, Float64) => true,
        (Date32, Date64) => true,
        // Timestamps of any unit are stored as microseconds. A zone-less
        // value cannot be written to a zoned column or the reverse.
        (Timestamp(_, from_tz), Timestamp(TimeUnit::Microsecond, to_tz)) => {
            from_tz.is_some() == to_tz.is_some()
        }
        _ => false,
    }
}

/// Layout a new table is created with. Untyped columns are stored as strings.
pub fn storable_layout(schema: &Schema) -> Schema {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|field| match field.data_type() {
            DataType::Null => Field::new(field.name(), DataType::Utf8, true),
            _ => field.as_ref().clone(),
        })
        .collect();
    Schema::new_with_metadata(fields, schema.metadata().clone())
}

/// Reorder, null-fill and cast a batch to the table layout.
///
/// The batch must already have passed [`check_compatible`] against `table`.
pub fn align_batch(
    batch: &RecordBatch,
    table: &SchemaRef,
) -> Result<RecordBatch, deltalake::arrow::error::ArrowError> {
    let columns: Vec<ArrayRef> = table
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(field.name()) {
            Some(column) if column.data_type() == field.data_type() => Ok(Arc::clone(column)),
            Some(column) if column.data_type() != &DataType::Null => {
                cast(column, field.data_type())
            }
            _ => Ok(new_null_array(field.data_type(), batch.num_rows())),
        })
        .collect::<Result<_, _>>()?;

    RecordBatch::try_new(Arc::clone(table), columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltalake::arrow::array::{Array, Int32Array, Int64Array, NullArray, StringArray};

    fn utc_micros() -> DataType {
        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
    }

    fn table_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("userId", DataType::Utf8, true),
            Field::new("searchTimestamp", utc_micros(), true),
        ]))
    }

    #[test]
    fn test_identical_schema_is_compatible() {
        let table = table_schema();
        assert!(check_compatible(&table, &table).is_ok());
    }

    #[test]
    fn test_widening_and_missing_nullable_accepted() {
        let staged = Schema::new(vec![
            Field::new("id", DataType::Int32, true),
            Field::new(
                "searchTimestamp",
                DataType::Timestamp(TimeUnit::Second, Some("+00:00".into())),
                true,
            ),
        ]);
        assert!(check_compatible(&staged, &table_schema()).is_ok());
    }

    #[test]
    fn test_all_offending_columns_reported() {
        let staged = Schema::new(vec![
            Field::new("userId", DataType::Int64, true),
            Field::new("toProvinceId", DataType::Int64, true),
        ]);
        let problems = check_compatible(&staged, &table_schema()).unwrap_err();
        let columns: Vec<&str> = problems.iter().map(Incompatibility::column).collect();
        assert_eq!(columns, vec!["userId", "toProvinceId", "id"]);
        assert!(describe(&problems).contains("does not exist in the table"));
    }

    #[test]
    fn test_narrowing_rejected() {
        assert!(!is_assignable(&DataType::Int64, &DataType::Int32));
        assert!(!is_assignable(&DataType::Float64, &DataType::Int64));
        assert!(!is_assignable(
            &DataType::Timestamp(TimeUnit::Microsecond, None),
            &utc_micros()
        ));
        assert!(is_assignable(&DataType::LargeUtf8, &DataType::Utf8View));
    }

    #[test]
    fn test_align_batch_reorders_casts_and_fills() {
        let staged = Arc::new(Schema::new(vec![
            Field::new("userId", DataType::Utf8, true),
            Field::new("id", DataType::Int32, false),
        ]));
        let batch = RecordBatch::try_new(
            staged,
            vec![
                Arc::new(StringArray::from(vec!["u1", "u2"])),
                Arc::new(Int32Array::from(vec![1, 2])),
            ],
        )
        .unwrap();

        let aligned = align_batch(&batch, &table_schema()).unwrap();
        assert_eq!(aligned.schema(), table_schema());
        let ids = aligned
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(ids.values(), &[1, 2]);
        assert_eq!(aligned.column(2).null_count(), 2);
    }

    #[test]
    fn test_untyped_column_fits_nullable_only() {
        let staged = Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("userId", DataType::Null, true),
        ]);
        assert!(check_compatible(&staged, &table_schema()).is_ok());

        let staged = Schema::new(vec![Field::new("id", DataType::Null, true)]);
        let problems = check_compatible(&staged, &table_schema()).unwrap_err();
        assert_eq!(problems[0].column(), "id");
    }

    #[test]
    fn test_align_batch_fills_untyped_column() {
        let staged = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("searchTimestamp", DataType::Null, true),
        ]));
        let batch = RecordBatch::try_new(
            staged,
            vec![
                Arc::new(Int64Array::from(vec![7])),
                Arc::new(NullArray::new(1)),
            ],
        )
        .unwrap();

        let aligned = align_batch(&batch, &table_schema()).unwrap();
        assert_eq!(aligned.column(2).data_type(), &utc_micros());
        assert_eq!(aligned.column(2).null_count(), 1);
    }

    #[test]
    fn test_storable_layout_types_untyped_columns() {
        let staged = Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("note", DataType::Null, true),
        ]);
        let layout = storable_layout(&staged);
        assert_eq!(layout.field(0), staged.field(0));
        assert_eq!(layout.field(1).data_type(), &DataType::Utf8);
    }
}
