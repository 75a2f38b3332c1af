//! Fully-qualified warehouse table identifiers.
//!
//! A [`TableRef`] is always exactly `project.dataset.table`. It can only be
//! built from three dot-free parts or parsed from a string with exactly three
//! parts, so a table name that already carries a project prefix can never be
//! concatenated into a longer, misrouted identifier.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Destination table in the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    project: String,
    dataset: String,
    table: String,
}

impl TableRef {
    /// Build a table reference from its three parts.
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let project = project.into();
        let dataset = dataset.into();
        let table = table.into();
        let display = format!("{project}.{dataset}.{table}");

        for (label, part) in [("project", &project), ("dataset", &dataset), ("table", &table)] {
            validate_part(&display, label, part)?;
        }

        Ok(Self {
            project,
            dataset,
            table,
        })
    }

    /// Parse a `project.dataset.table` identifier.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = value.split('.').collect();
        if parts.len() != 3 {
            return Err(ConfigError::InvalidTableRef {
                value: value.to_string(),
                reason: format!("expected 3 dot-separated parts, found {}", parts.len()),
            });
        }
        Self::new(parts[0], parts[1], parts[2])
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Path segments used to locate the table under the warehouse root.
    pub fn segments(&self) -> [&str; 3] {
        [&self.project, &self.dataset, &self.table]
    }
}

fn validate_part(display: &str, label: &str, part: &str) -> Result<(), ConfigError> {
    let reason = if part.trim().is_empty() {
        Some(format!("{label} is empty"))
    } else if part.contains('.') {
        Some(format!("{label} '{part}' must not contain '.'"))
    } else if part.contains('/') {
        Some(format!("{label} '{part}' must not contain '/'"))
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ConfigError::InvalidTableRef {
            value: display.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

impl FromStr for TableRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_three_parts() {
        let table = TableRef::parse("dacntt-dfabb.duancntt.tickets").unwrap();
        assert_eq!(table.project(), "dacntt-dfabb");
        assert_eq!(table.dataset(), "duancntt");
        assert_eq!(table.table(), "tickets");
        assert_eq!(table.to_string(), "dacntt-dfabb.duancntt.tickets");
    }

    #[test]
    fn test_rejects_duplicated_project_prefix() {
        // A project constant that already carries the project prefix must not
        // silently produce a four-part identifier.
        let result = TableRef::new("dacntt-dfabb.dacntt-dfabb", "duancntt", "tickets");
        assert!(result.is_err());

        let result = TableRef::parse("dacntt-dfabb.dacntt-dfabb.duancntt.tickets");
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_partially_qualified() {
        assert!(TableRef::parse("duancntt.tickets").is_err());
        assert!(TableRef::parse("tickets").is_err());
        assert!(TableRef::parse("p..t").is_err());
    }

    #[test]
    fn test_table_with_dot_rejected() {
        let err = TableRef::new("p", "d", "d.tickets").unwrap_err();
        assert!(err.to_string().contains("must not contain '.'"));
    }

    #[test]
    fn test_from_str() {
        let table: TableRef = "p.d.t".parse().unwrap();
        assert_eq!(table.segments(), ["p", "d", "t"]);
    }
}
