//! Idempotent per-day ingestion of metric rows.
//!
//! One [`IngestionPipeline::write`] call is one unit of work for an
//! (app, metric, dimension, date) tuple: the rows are staged into a temporary
//! tab-delimited file, then, while holding a [`ConcurrencyLimiter`] permit, the
//! existing (date, app) slice is deleted and the file is loaded and awaited.
//! Re-running a unit replaces its slice instead of duplicating it.

use std::io::{BufWriter, Write};
use std::sync::Arc;

use chrono::NaiveDate;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::analytics::MetricRow;
use crate::limiter::ConcurrencyLimiter;
use crate::registry::{RegistryError, TableRegistry};
use crate::store::{StoreError, TableSpec, TableStore, WriteMode};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("load into {table} failed: {source}")]
    JobFailed {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("load resources unavailable: {0}")]
    ResourceUnavailable(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("row {index} cannot be loaded: {reason}")]
    InvalidRecord { index: usize, reason: String },
}

impl LoadError {
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::JobFailed { .. } => "Re-run the same date and app; the slice is replaced, not duplicated.",
            Self::ResourceUnavailable(_) => "Check free space in the temp directory and retry.",
            Self::Registry(RegistryError::UnknownMetric(_)) => "Use a metric id from the catalog.",
            Self::Registry(RegistryError::Store(_)) => "Check the project, dataset and access token.",
            Self::InvalidRecord { .. } => "Fix the source rows; fields may not contain tabs or newlines.",
        }
    }
}

pub struct IngestionPipeline<S> {
    registry: Arc<TableRegistry<S>>,
    limiter: ConcurrencyLimiter,
}

impl<S> Clone for IngestionPipeline<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            limiter: self.limiter.clone(),
        }
    }
}

impl<S: TableStore> IngestionPipeline<S> {
    pub fn new(registry: Arc<TableRegistry<S>>, limiter: ConcurrencyLimiter) -> Self {
        Self { registry, limiter }
    }

    pub fn registry(&self) -> &Arc<TableRegistry<S>> {
        &self.registry
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Replace the (date, app_name) slice of the metric's table with `rows`.
    ///
    /// `overwrite` truncates the whole table before loading instead of
    /// appending. Returns the name of the table written to.
    pub async fn write(
        &self,
        app_name: &str,
        metric_id: &str,
        dimension: Option<&str>,
        date: NaiveDate,
        rows: &[MetricRow],
        overwrite: bool,
    ) -> Result<String, LoadError> {
        let table = self.registry.ensure_table(metric_id, dimension).await?;
        if rows.is_empty() {
            debug!(table = %table.name, app_name, %date, "no rows; skipping load");
            return Ok(table.name.clone());
        }

        let lines = render_records(app_name, dimension, date, rows)?;
        let staged = stage(&lines).map_err(|e| {
            LoadError::ResourceUnavailable(format!("staging rows for {}: {e}", table.name))
        })?;

        let permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| LoadError::ResourceUnavailable(e.to_string()))?;
        let mode = WriteMode::from_overwrite(overwrite);
        let outcome = self.replace_slice(&table, app_name, date, &staged, mode).await;
        drop(permit);

        outcome.map_err(|source| LoadError::JobFailed {
            table: table.name.clone(),
            source,
        })?;
        info!(
            table = %table.name,
            app_name,
            %date,
            rows = rows.len(),
            mode = mode.disposition(),
            "loaded rows"
        );
        Ok(table.name.clone())
    }

    async fn replace_slice(
        &self,
        table: &TableSpec,
        app_name: &str,
        date: NaiveDate,
        staged: &NamedTempFile,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        let store = self.registry.store();
        store.delete_partition(&table.name, date, app_name).await?;
        let job = store.submit_load(table, staged.path(), mode).await?;
        store.wait_for_job(&job).await
    }
}

/// Tab-delimited lines `date, app_name, value[, dimension]`.
///
/// Without a dimension the label column is left out so the line matches the
/// three-column table.
pub fn render_records(
    app_name: &str,
    dimension: Option<&str>,
    date: NaiveDate,
    rows: &[MetricRow],
) -> Result<Vec<String>, LoadError> {
    let invalid = |index: usize, reason: String| LoadError::InvalidRecord { index, reason };
    check_field(app_name).map_err(|reason| invalid(0, format!("app name {reason}")))?;

    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            if row.date != date {
                return Err(invalid(
                    index,
                    format!("dated {} but the load targets {date}", row.date),
                ));
            }
            let mut line = format!(
                "{}\t{}\t{}",
                row.date.format("%Y-%m-%d"),
                app_name,
                row.value
            );
            if let Some(dimension) = dimension {
                let label = row
                    .dimension
                    .as_deref()
                    .filter(|label| !label.is_empty())
                    .ok_or_else(|| invalid(index, format!("no {dimension} label")))?;
                check_field(label).map_err(|reason| invalid(index, format!("label {reason}")))?;
                line.push('\t');
                line.push_str(label);
            }
            Ok(line)
        })
        .collect()
}

fn check_field(value: &str) -> Result<(), String> {
    if value.contains(['\t', '\n', '\r']) {
        return Err(format!("{value:?} contains a tab or line break"));
    }
    Ok(())
}

/// Write `lines` to a temporary file removed when the handle drops.
fn stage(lines: &[String]) -> std::io::Result<NamedTempFile> {
    let file = tempfile::Builder::new()
        .prefix("asa-load-")
        .suffix(".tsv")
        .tempfile()?;
    let mut writer = BufWriter::new(file.as_file());
    for line in lines {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    drop(writer);
    Ok(file)
}
