//! In-process [`TableStore`] used by `--dry-run` and the test suites.
//!
//! Loads are staged by `submit_load` and applied by `wait_for_job`, mirroring
//! the asynchronous job model of the real store.

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;

use super::{CreateOutcome, JobHandle, StoreError, TableSpec, TableStore, WriteMode};

/// Per-operation call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub exists_checks: usize,
    pub creates: usize,
    pub deletes: usize,
    pub rows_deleted: u64,
    pub loads: usize,
    pub truncating_loads: usize,
    pub rows_loaded: u64,
}

#[derive(Debug)]
struct MemoryTable {
    spec: TableSpec,
    rows: Vec<Vec<String>>,
}

#[derive(Debug)]
struct StagedLoad {
    table: String,
    mode: WriteMode,
    rows: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
struct Inner {
    dataset_ready: bool,
    tables: HashMap<String, MemoryTable>,
    staged: HashMap<String, StagedLoad>,
    next_job: u64,
    fail_jobs: Option<String>,
    stats: StoreStats,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.lock().stats
    }

    pub fn dataset_ready(&self) -> bool {
        self.inner.lock().dataset_ready
    }

    pub fn table(&self, name: &str) -> Option<TableSpec> {
        self.inner.lock().tables.get(name).map(|t| t.spec.clone())
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.lock().tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every stored row of `table`, as the tab-separated fields it was loaded with.
    pub fn rows(&self, table: &str) -> Vec<Vec<String>> {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Rows of `table` belonging to `app_name` on `date`.
    pub fn slice_len(&self, table: &str, date: NaiveDate, app_name: &str) -> usize {
        let date = date.format("%Y-%m-%d").to_string();
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.iter().filter(|r| in_slice(r, &date, app_name)).count())
            .unwrap_or(0)
    }

    /// Make every job awaited from now on fail with `reason`.
    pub fn fail_jobs(&self, reason: impl Into<String>) {
        self.inner.lock().fail_jobs = Some(reason.into());
    }
}

fn in_slice(row: &[String], date: &str, app_name: &str) -> bool {
    row.first().map(String::as_str) == Some(date) && row.get(1).map(String::as_str) == Some(app_name)
}

impl TableStore for MemoryStore {
    async fn ensure_dataset(&self) -> Result<(), StoreError> {
        self.inner.lock().dataset_ready = true;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        inner.stats.exists_checks += 1;
        Ok(inner.tables.contains_key(table))
    }

    async fn create_table(&self, spec: &TableSpec) -> Result<CreateOutcome, StoreError> {
        let mut inner = self.inner.lock();
        inner.stats.creates += 1;
        if inner.tables.contains_key(&spec.name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.tables.insert(
            spec.name.clone(),
            MemoryTable {
                spec: spec.clone(),
                rows: Vec::new(),
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn delete_partition(
        &self,
        table: &str,
        date: NaiveDate,
        app_name: &str,
    ) -> Result<u64, StoreError> {
        let date = date.format("%Y-%m-%d").to_string();
        let mut inner = self.inner.lock();
        inner.stats.deletes += 1;
        let stored = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        let before = stored.rows.len();
        stored.rows.retain(|row| !in_slice(row, &date, app_name));
        let deleted = (before - stored.rows.len()) as u64;
        inner.stats.rows_deleted += deleted;
        Ok(deleted)
    }

    async fn submit_load(
        &self,
        spec: &TableSpec,
        source: &Path,
        mode: WriteMode,
    ) -> Result<JobHandle, StoreError> {
        let contents = tokio::fs::read_to_string(source).await?;
        let rows: Vec<Vec<String>> = contents
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.split('\t').map(str::to_string).collect())
            .collect();

        let mut inner = self.inner.lock();
        if !inner.tables.contains_key(&spec.name) {
            return Err(StoreError::MissingTable(spec.name.clone()));
        }
        inner.next_job += 1;
        let job_id = format!("memory-load-{}", inner.next_job);
        inner.stats.loads += 1;
        if mode == WriteMode::Truncate {
            inner.stats.truncating_loads += 1;
        }
        inner.staged.insert(
            job_id.clone(),
            StagedLoad {
                table: spec.name.clone(),
                mode,
                rows,
            },
        );
        Ok(JobHandle {
            job_id,
            location: None,
        })
    }

    async fn wait_for_job(&self, job: &JobHandle) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let staged = inner
            .staged
            .remove(&job.job_id)
            .ok_or_else(|| StoreError::JobFailed {
                job_id: job.job_id.clone(),
                reason: "unknown job".to_string(),
            })?;
        if let Some(reason) = inner.fail_jobs.clone() {
            return Err(StoreError::JobFailed {
                job_id: job.job_id.clone(),
                reason,
            });
        }

        let table = inner
            .tables
            .get_mut(&staged.table)
            .ok_or_else(|| StoreError::MissingTable(staged.table.clone()))?;
        let width = table.spec.columns.len();
        if let Some(bad) = staged.rows.iter().find(|row| row.len() != width) {
            return Err(StoreError::JobFailed {
                job_id: job.job_id.clone(),
                reason: format!("expected {width} fields, found {}", bad.len()),
            });
        }

        let loaded = staged.rows.len() as u64;
        match staged.mode {
            WriteMode::Truncate => table.rows = staged.rows,
            WriteMode::Append => table.rows.extend(staged.rows),
        }
        inner.stats.rows_loaded += loaded;
        Ok(())
    }
}
