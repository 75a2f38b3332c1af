//! Appending staged objects to warehouse tables.
//!
//! A load reads one staged object, decodes it against a declared or inferred
//! layout, checks that layout against the destination table (creating the
//! table when allowed) and appends all rows in a single Delta commit. The
//! table is never truncated, updated or evolved. A load that fails before
//! the commit leaves the table as it was.

mod decode;
mod schema;
mod table;

pub use decode::{DecodedPayload, decode_payload};
pub use schema::{
    Incompatibility, align_batch, check_compatible, is_assignable, storable_layout,
};
pub use table::{Warehouse, table_schema};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use deltalake::arrow::array::RecordBatch;
use deltalake::arrow::datatypes::SchemaRef;
use deltalake::protocol::SaveMode;
use snafu::prelude::*;
use tracing::{debug, info};

use crate::config::{CreateDisposition, TableRef};
use crate::emit;
use crate::error::{
    DeltaSnafu, LoadError, ReadObjectSnafu, SchemaMismatchSnafu, TableNotFoundSnafu,
    WarehouseStorageSnafu,
};
use crate::metrics::events::{DeltaCommitCompleted, RowsLoaded, Stage, StageCompleted};
use crate::staging::ObjectRef;
use crate::storage::StorageProviderRef;

/// Outcome of one load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub table: TableRef,
    pub rows_appended: usize,
    /// Table version after the load.
    pub version: i64,
    /// Whether this load created the table.
    pub created: bool,
}

impl fmt::Display for LoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rows into {} at version {}",
            self.rows_appended, self.table, self.version
        )
    }
}

/// Loads staged objects from the staging bucket into the warehouse.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    staging: StorageProviderRef,
    warehouse: Warehouse,
}

impl BatchLoader {
    pub fn new(staging: StorageProviderRef, warehouse: Warehouse) -> Self {
        Self { staging, warehouse }
    }

    /// Build a loader for the warehouse rooted at `url`.
    pub fn for_url(
        staging: StorageProviderRef,
        url: &str,
        storage_options: HashMap<String, String>,
    ) -> Result<Self, LoadError> {
        let warehouse = Warehouse::new(url, storage_options).context(WarehouseStorageSnafu)?;
        Ok(Self::new(staging, warehouse))
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    /// Append the rows of `object` to `table`.
    ///
    /// The payload is read against `declared`, or else the existing table's
    /// layout, and only inferred when neither exists. With
    /// [`CreateDisposition::CreateIfNeeded`] a missing table is created from
    /// the declared layout or the payload's; with
    /// [`CreateDisposition::CreateNever`] it is an error. Concurrent first
    /// loads of one table all append to whichever creation wins.
    pub async fn load(
        &self,
        object: &ObjectRef,
        table: &TableRef,
        declared: Option<&SchemaRef>,
        disposition: CreateDisposition,
    ) -> Result<LoadResult, LoadError> {
        let start = Instant::now();
        let table_name = table.to_string();

        let bytes = self
            .staging
            .get(object.path.clone())
            .await
            .context(ReadObjectSnafu {
                path: object.url(),
            })?;

        let existing = self.warehouse.open(table).await?;

        // Declared layout first, then the table's own.
        let read_layout = match (declared, &existing) {
            (Some(declared), _) => Some(Arc::clone(declared)),
            (None, Some(existing)) => Some(table_schema(existing, table)?),
            (None, None) => None,
        };
        let payload = decode_payload(&bytes, object.format, read_layout.as_ref(), &table_name)?;
        debug!(
            table = %table,
            object = %object,
            rows = payload.num_rows,
            "Decoded staged object"
        );

        let (delta_table, created) = match existing {
            Some(existing) => (existing, false),
            None => {
                ensure!(
                    disposition == CreateDisposition::CreateIfNeeded,
                    TableNotFoundSnafu { table: &table_name }
                );
                let layout = storable_layout(declared.unwrap_or(&payload.schema));
                self.warehouse.create_or_open(table, &layout).await?
            }
        };

        let layout = table_schema(&delta_table, table)?;
        if let Err(problems) = check_compatible(&payload.schema, &layout) {
            return SchemaMismatchSnafu {
                table: &table_name,
                details: schema::describe(&problems),
            }
            .fail();
        }

        let batches = payload
            .batches
            .iter()
            .filter(|batch| batch.num_rows() > 0)
            .map(|batch| align_batch(batch, &layout))
            .collect::<Result<Vec<RecordBatch>, _>>()
            .map_err(|e| LoadError::SchemaMismatch {
                table: table_name.clone(),
                details: e.to_string(),
            })?;

        let (version, rows_appended) = if batches.is_empty() {
            (delta_table.version().unwrap_or_default(), 0)
        } else {
            let commit_start = Instant::now();
            let delta_table = delta_table
                .write(batches)
                .with_save_mode(SaveMode::Append)
                .await
                .context(DeltaSnafu { table: &table_name })?;
            emit!(DeltaCommitCompleted {
                duration: commit_start.elapsed(),
            });
            (delta_table.version().unwrap_or_default(), payload.num_rows)
        };

        emit!(RowsLoaded {
            table: table_name.clone(),
            count: rows_appended as u64,
        });
        emit!(StageCompleted {
            stage: Stage::Load,
            duration: start.elapsed(),
        });

        let result = LoadResult {
            table: table.clone(),
            rows_appended,
            version,
            created,
        };
        info!(
            table = %table,
            object = %object,
            rows = rows_appended,
            version,
            created,
            "Loaded staged object"
        );
        Ok(result)
    }
}
