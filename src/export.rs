//! Export of one app's metrics for one day.
//!
//! Every catalog metric is exported as a total and once per configured
//! dimension. Units run concurrently; the [`ConcurrencyLimiter`](crate::limiter::ConcurrencyLimiter)
//! inside the pipeline bounds how many loads hit the store at once. A failed
//! unit is logged and reported, the others carry on.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::analytics::{MetricRequest, MetricsClient, RequestError};
use crate::catalog::{self, MetricInfo};
use crate::config::AppDefinition;
use crate::http::HttpTransport;
use crate::ingest::{IngestionPipeline, LoadError};
use crate::store::TableStore;

#[derive(Error, Debug)]
pub enum UnitError {
    #[error("fetching series failed: {0}")]
    Request(#[from] RequestError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanError {
    #[error("--overwrite truncates shared tables, so it takes exactly one app ({0} selected)")]
    OverwriteAcrossApps(usize),
}

impl PlanError {
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::OverwriteAcrossApps(_) => {
                "Pass a single --app with --overwrite, or drop --overwrite; re-runs already replace each app's day."
            }
        }
    }
}

/// One plan per app. Apps share tables, so a truncating load for one app
/// would drop the rows of every app loaded before it.
pub fn plan_exports(
    apps: &[AppDefinition],
    date: NaiveDate,
    dimensions: &[String],
    overwrite: bool,
) -> Result<Vec<ExportPlan>, PlanError> {
    if overwrite && apps.len() > 1 {
        return Err(PlanError::OverwriteAcrossApps(apps.len()));
    }
    Ok(apps
        .iter()
        .map(|app| ExportPlan::full(app.clone(), date, dimensions, overwrite))
        .collect())
}

/// What to export.
#[derive(Debug, Clone)]
pub struct ExportPlan {
    pub app: AppDefinition,
    pub date: NaiveDate,
    pub metrics: Vec<&'static MetricInfo>,
    /// `None` is the ungrouped total.
    pub dimensions: Vec<Option<String>>,
    pub overwrite: bool,
}

impl ExportPlan {
    /// Every catalog metric, as a total and broken down by each of `dimensions`.
    pub fn full(app: AppDefinition, date: NaiveDate, dimensions: &[String], overwrite: bool) -> Self {
        let dimensions = std::iter::once(None)
            .chain(dimensions.iter().cloned().map(Some))
            .collect();
        Self {
            app,
            date,
            metrics: catalog::METRICS.iter().collect(),
            dimensions,
            overwrite,
        }
    }

    pub fn unit_count(&self) -> usize {
        self.metrics.len() * self.dimensions.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub metric: String,
    pub dimension: Option<String>,
    pub table: Option<String>,
    pub rows: usize,
    pub error: Option<String>,
}

impl UnitReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub app: String,
    pub date: NaiveDate,
    pub units: Vec<UnitReport>,
}

impl ExportSummary {
    pub fn failed(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|u| !u.succeeded())
    }

    pub fn failure_count(&self) -> usize {
        self.failed().count()
    }

    pub fn rows_loaded(&self) -> usize {
        self.units.iter().filter(|u| u.succeeded()).map(|u| u.rows).sum()
    }
}

/// Fetch and load one (metric, dimension) pair.
pub async fn export_unit<T, S>(
    client: &MetricsClient<T>,
    pipeline: &IngestionPipeline<S>,
    app: &AppDefinition,
    metric: &MetricInfo,
    dimension: Option<&str>,
    date: NaiveDate,
    overwrite: bool,
) -> Result<(String, usize), UnitError>
where
    T: HttpTransport,
    S: TableStore,
{
    let request = MetricRequest::new(&app.id, metric.id, date, date).with_dimension(dimension);
    let payload = client.get_metric(&request).await?;
    let rows = payload.rows(metric.id);
    let table = pipeline
        .write(&app.name, metric.id, dimension, date, &rows, overwrite)
        .await?;
    Ok((table, rows.len()))
}

/// Run every unit of `plan` and collect the outcome of each.
pub async fn run_export<T, S>(
    client: Arc<MetricsClient<T>>,
    pipeline: IngestionPipeline<S>,
    plan: &ExportPlan,
) -> ExportSummary
where
    T: HttpTransport + 'static,
    S: TableStore + 'static,
{
    info!(app = %plan.app.name, date = %plan.date, units = plan.unit_count(), "starting export");
    let mut tasks = JoinSet::new();
    for metric in &plan.metrics {
        for dimension in &plan.dimensions {
            let client = Arc::clone(&client);
            let pipeline = pipeline.clone();
            let app = plan.app.clone();
            let metric: &'static MetricInfo = metric;
            let dimension = dimension.clone();
            let (date, overwrite) = (plan.date, plan.overwrite);
            tasks.spawn(async move {
                let outcome = export_unit(
                    &client,
                    &pipeline,
                    &app,
                    metric,
                    dimension.as_deref(),
                    date,
                    overwrite,
                )
                .await;
                report(metric, dimension, outcome)
            });
        }
    }

    let mut units = Vec::with_capacity(plan.unit_count());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(unit) => units.push(unit),
            Err(err) => {
                warn!(error = %err, "export task aborted");
                units.push(UnitReport {
                    metric: "<unknown>".to_string(),
                    dimension: None,
                    table: None,
                    rows: 0,
                    error: Some(err.to_string()),
                });
            }
        }
    }
    units.sort_by(|a, b| (&a.metric, &a.dimension).cmp(&(&b.metric, &b.dimension)));

    let summary = ExportSummary {
        app: plan.app.name.clone(),
        date: plan.date,
        units,
    };
    info!(
        app = %summary.app,
        date = %summary.date,
        rows = summary.rows_loaded(),
        failed = summary.failure_count(),
        "export finished"
    );
    summary
}

fn report(
    metric: &MetricInfo,
    dimension: Option<String>,
    outcome: Result<(String, usize), UnitError>,
) -> UnitReport {
    match outcome {
        Ok((table, rows)) => UnitReport {
            metric: metric.id.to_string(),
            dimension,
            table: Some(table),
            rows,
            error: None,
        },
        Err(err) => {
            warn!(metric = metric.id, dimension = dimension.as_deref(), error = %err, "export unit failed");
            UnitReport {
                metric: metric.id.to_string(),
                dimension,
                table: None,
                rows: 0,
                error: Some(err.to_string()),
            }
        }
    }
}
