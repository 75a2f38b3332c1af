//! Locating, opening and creating warehouse tables.
//!
//! A table `project.dataset.table` lives at
//! `<warehouse_root>/<project>/<dataset>/<table>`.

use std::collections::HashMap;
use std::sync::Once;

use deltalake::DeltaTable;
use deltalake::arrow::datatypes::{Schema, SchemaRef};
use deltalake::kernel::StructType;
use deltalake::kernel::engine::arrow_conversion::TryIntoKernel;
use snafu::prelude::*;
use tracing::{debug, info};
use url::Url;

use crate::config::TableRef;
use crate::error::{
    DeltaSnafu, IoSnafu, LoadError, SchemaConversionSnafu, StorageError, TableUrlSnafu,
    WarehouseStorageSnafu,
};
use crate::storage::BackendConfig;

fn register_handlers() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        deltalake::aws::register_handlers(None);
        deltalake::gcp::register_handlers(None);
        deltalake::azure::register_handlers(None);
    });
}

/// The Delta root that destination tables are created under.
#[derive(Debug, Clone)]
pub struct Warehouse {
    config: BackendConfig,
    storage_options: HashMap<String, String>,
}

impl Warehouse {
    pub fn new(url: &str, storage_options: HashMap<String, String>) -> Result<Self, StorageError> {
        register_handlers();
        let config = BackendConfig::parse_url(url)?;
        let storage_options = with_backend_options(&config, storage_options);
        Ok(Self {
            config,
            storage_options,
        })
    }

    /// Location of a table under the warehouse root.
    pub fn table_url(&self, table: &TableRef) -> Result<Url, LoadError> {
        let [project, dataset, name] = table.segments();
        let join = |root: String, key: Option<&object_store::path::Path>| match key {
            Some(key) => format!("{root}/{key}/{project}/{dataset}/{name}"),
            None => format!("{root}/{project}/{dataset}/{name}"),
        };

        let url = match &self.config {
            BackendConfig::S3(s3) => join(format!("s3://{}", s3.bucket), s3.key.as_ref()),
            BackendConfig::Gcs(gcs) => join(format!("gs://{}", gcs.bucket), gcs.key.as_ref()),
            BackendConfig::Azure(azure) => join(
                format!(
                    "abfss://{}@{}.dfs.core.windows.net",
                    azure.container, azure.account
                ),
                azure.key.as_ref(),
            ),
            BackendConfig::Local(local) => {
                let path = std::path::Path::new(&local.path)
                    .join(project)
                    .join(dataset)
                    .join(name);
                return Url::from_directory_path(&path).map_err(|()| {
                    TableUrlSnafu {
                        url: path.display().to_string(),
                    }
                    .build()
                });
            }
        };

        Url::parse(&url).ok().context(TableUrlSnafu { url })
    }

    /// Open a table. `None` means no table has been created at its location.
    pub async fn open(&self, table: &TableRef) -> Result<Option<DeltaTable>, LoadError> {
        let url = self.table_url(table)?;

        if let BackendConfig::Local(_) = self.config
            && let Ok(path) = url.to_file_path()
        {
            tokio::fs::create_dir_all(&path)
                .await
                .context(IoSnafu)
                .context(WarehouseStorageSnafu)?;
        }

        let delta_table =
            DeltaTable::try_from_url_with_storage_options(url, self.storage_options.clone())
                .await
                .context(DeltaSnafu {
                    table: table.to_string(),
                })?;

        Ok(delta_table.version().is_some().then_some(delta_table))
    }

    /// Create a table with the given layout.
    ///
    /// Creation is an atomic Delta commit; a concurrent creator of the same
    /// table makes this fail rather than overwrite. See [`Self::create_or_open`].
    pub async fn create(&self, table: &TableRef, schema: &Schema) -> Result<DeltaTable, LoadError> {
        let url = self.table_url(table)?;
        let delta_schema: StructType = schema.try_into_kernel().map_err(|e| {
            SchemaConversionSnafu {
                table: table.to_string(),
                message: e.to_string(),
            }
            .build()
        })?;

        info!(table = %table, location = %url, "Creating destination table");

        let delta_table =
            DeltaTable::try_from_url_with_storage_options(url, self.storage_options.clone())
                .await
                .context(DeltaSnafu {
                    table: table.to_string(),
                })?
                .create()
                .with_columns(delta_schema.fields().cloned())
                .await
                .context(DeltaSnafu {
                    table: table.to_string(),
                })?;

        Ok(delta_table)
    }

    /// Create a table, or open it when another load created it first.
    ///
    /// Returns the table and whether this call created it.
    pub async fn create_or_open(
        &self,
        table: &TableRef,
        schema: &Schema,
    ) -> Result<(DeltaTable, bool), LoadError> {
        match self.create(table, schema).await {
            Ok(created) => Ok((created, true)),
            Err(create_error) => match self.open(table).await? {
                Some(existing) => {
                    debug!(
                        table = %table,
                        error = %create_error,
                        "Table was created concurrently, using it"
                    );
                    Ok((existing, false))
                }
                None => Err(create_error),
            },
        }
    }
}

/// Current Arrow layout of an opened table.
pub fn table_schema(delta_table: &DeltaTable, table: &TableRef) -> Result<SchemaRef, LoadError> {
    let state = delta_table.snapshot().context(DeltaSnafu {
        table: table.to_string(),
    })?;
    Ok(state.snapshot().arrow_schema())
}

// Delta resolves credentials from the options map, not the environment the
// staging client reads. Endpoint and region from the URL are carried over.
fn with_backend_options(
    config: &BackendConfig,
    mut options: HashMap<String, String>,
) -> HashMap<String, String> {
    if let BackendConfig::S3(s3) = config {
        if let Some(endpoint) = &s3.endpoint {
            options
                .entry("aws_endpoint".to_string())
                .or_insert_with(|| endpoint.clone());
            if endpoint.starts_with("http://") {
                options
                    .entry("aws_allow_http".to_string())
                    .or_insert_with(|| "true".to_string());
            }
        }
        if let Some(region) = &s3.region {
            options
                .entry("aws_region".to_string())
                .or_insert_with(|| region.clone());
        }
    }
    options
}
