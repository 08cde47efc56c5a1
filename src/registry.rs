//! Lazily created destination tables, at most one creation per name per process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{self, MetricInfo};
use crate::store::{
    ColumnSpec, ColumnType, CreateOutcome, PARTITION_FIELD, StoreError, TableSpec, TableStore,
};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Schema of the table a metric lands in: date, app, value, optional dimension.
pub fn table_spec(metric: &MetricInfo, dimension: Option<&str>) -> TableSpec {
    let mut columns = vec![
        ColumnSpec::new(PARTITION_FIELD, ColumnType::Date),
        ColumnSpec::new("app_name", ColumnType::String),
        ColumnSpec::new(metric.name, ColumnType::from(metric.kind)),
    ];
    if let Some(dimension) = dimension {
        columns.push(ColumnSpec::new(dimension, ColumnType::String));
    }
    TableSpec {
        name: catalog::table_name(metric, dimension),
        columns,
        description: metric.description.to_string(),
        partition_field: PARTITION_FIELD.to_string(),
    }
}

pub struct TableRegistry<S> {
    store: Arc<S>,
    ensured: Mutex<HashMap<String, Arc<TableSpec>>>,
}

impl<S: TableStore> TableRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            ensured: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Make sure the table for `metric_id` (and `dimension`) exists and return its spec.
    ///
    /// The first successful call per table name talks to the store; later calls
    /// are answered from the cache. Losing a creation race is success.
    pub async fn ensure_table(
        &self,
        metric_id: &str,
        dimension: Option<&str>,
    ) -> Result<Arc<TableSpec>, RegistryError> {
        let metric = catalog::metric(metric_id)
            .ok_or_else(|| RegistryError::UnknownMetric(metric_id.to_string()))?;
        let name = catalog::table_name(metric, dimension);
        let cached = self.ensured.lock().get(&name).cloned();
        if let Some(spec) = cached {
            return Ok(spec);
        }

        let spec = table_spec(metric, dimension);
        if self.store.table_exists(&spec.name).await? {
            debug!(table = %spec.name, "table already exists");
        } else {
            match self.store.create_table(&spec).await? {
                CreateOutcome::Created => info!(table = %spec.name, "created table"),
                CreateOutcome::AlreadyExists => {
                    debug!(table = %spec.name, "table created concurrently")
                }
            }
        }

        let mut ensured = self.ensured.lock();
        let spec = ensured
            .entry(name)
            .or_insert_with(|| Arc::new(spec))
            .clone();
        Ok(spec)
    }

    /// Names of every table ensured so far, sorted.
    pub fn ensured_tables(&self) -> Vec<String> {
        let mut names: Vec<_> = self.ensured.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
