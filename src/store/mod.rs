//! Destination table store.
//!
//! [`TableStore`] is the narrow slice of BigQuery the exporter needs: dataset
//! and table existence, partitioned table creation, deleting one app's rows
//! for one day, and tab-delimited load jobs awaited to completion.
//!
//! - [`bigquery`]: BigQuery v2 REST implementation
//! - [`memory`]: in-process implementation for dry runs and tests

pub mod bigquery;
pub mod memory;

use std::future::Future;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::MetricKind;
use crate::http::TransportError;

pub use bigquery::{BigQueryConfig, BigQueryStore};
pub use memory::{MemoryStore, StoreStats};

/// Column the destination tables are partitioned on.
pub const PARTITION_FIELD: &str = "date";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Date,
    String,
    Int64,
    Float64,
}

impl From<MetricKind> for ColumnType {
    fn from(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Int64 => Self::Int64,
            MetricKind::Float64 => Self::Float64,
        }
    }
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Date => "DATE",
            Self::String => "STRING",
            Self::Int64 => "INT64",
            Self::Float64 => "FLOAT64",
        }
    }
}

/// A required column of a destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Everything needed to create and load a destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub description: String,
    /// Day-partitioning column.
    pub partition_field: String,
}

/// How a load treats rows already in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Keep existing rows.
    Append,
    /// Replace the whole table with the loaded rows.
    Truncate,
}

impl WriteMode {
    pub fn from_overwrite(overwrite: bool) -> Self {
        if overwrite { Self::Truncate } else { Self::Append }
    }

    pub fn disposition(self) -> &'static str {
        match self {
            Self::Append => "WRITE_APPEND",
            Self::Truncate => "WRITE_TRUNCATE",
        }
    }
}

/// Result of asking the store to create a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Someone else created it first; as good as created.
    AlreadyExists,
}

/// A submitted load job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    pub location: Option<String>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("table store returned {status} for {operation}: {message}")]
    Http {
        operation: &'static str,
        status: u16,
        message: String,
    },

    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("table {0} does not exist")]
    MissingTable(String),

    #[error("unexpected table store response for {operation}: {message}")]
    UnexpectedShape {
        operation: &'static str,
        message: String,
    },

    #[error("reading load source failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The table store collaborator.
pub trait TableStore: Send + Sync {
    /// Create the dataset when it does not exist yet.
    fn ensure_dataset(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn table_exists(&self, table: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Create a day-partitioned table. "Already exists" is not an error.
    fn create_table(
        &self,
        spec: &TableSpec,
    ) -> impl Future<Output = Result<CreateOutcome, StoreError>> + Send;

    /// Delete the rows of `app_name` on `date`. Returns how many rows went away.
    fn delete_partition(
        &self,
        table: &str,
        date: NaiveDate,
        app_name: &str,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Start loading the tab-delimited file at `source` into `spec`.
    fn submit_load(
        &self,
        spec: &TableSpec,
        source: &Path,
        mode: WriteMode,
    ) -> impl Future<Output = Result<JobHandle, StoreError>> + Send;

    /// Resolve once the job reached a terminal state.
    fn wait_for_job(&self, job: &JobHandle) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_maps_to_truncate() {
        assert_eq!(WriteMode::from_overwrite(true), WriteMode::Truncate);
        assert_eq!(WriteMode::from_overwrite(false), WriteMode::Append);
        assert_eq!(WriteMode::Truncate.disposition(), "WRITE_TRUNCATE");
        assert_eq!(WriteMode::Append.disposition(), "WRITE_APPEND");
    }

    #[test]
    fn column_spec_serializes_like_bigquery_schema() {
        let column = ColumnSpec::new("app_name", ColumnType::String);
        assert_eq!(
            serde_json::to_value(&column).unwrap(),
            serde_json::json!({"name": "app_name", "type": "STRING"})
        );
        assert_eq!(ColumnType::from(MetricKind::Float64), ColumnType::Float64);
    }
}
