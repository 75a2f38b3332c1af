//! Row sets produced by window extraction.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::SourceError;

/// A single typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    /// Arbitrary-precision decimal kept in its exact textual form.
    Numeric(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or(Scalar::Null, Into::into)
    }
}

/// Ordered rows sharing one column list, in the source's column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    columns: Vec<String>,
    rows: Vec<Vec<Scalar>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row. Its width must match the column list.
    pub fn push(&mut self, row: Vec<Scalar>) -> Result<(), SourceError> {
        if row.len() != self.columns.len() {
            return Err(SourceError::RowWidth {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Scalar>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_checks_width() {
        let mut rows = RowSet::new(vec!["id".to_string(), "name".to_string()]);
        rows.push(vec![1i64.into(), "a".into()]).unwrap();

        let err = rows.push(vec![2i64.into()]).unwrap_err();
        assert!(matches!(
            err,
            SourceError::RowWidth {
                expected: 2,
                actual: 1
            }
        ));
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_option_into_scalar() {
        assert_eq!(Scalar::from(None::<i64>), Scalar::Null);
        assert_eq!(Scalar::from(Some("x")), Scalar::Text("x".to_string()));
    }
}
