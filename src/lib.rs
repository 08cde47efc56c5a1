//! Export App Store Connect analytics into day-partitioned BigQuery tables.
//!
//! The pieces, leaf first:
//!
//! - [`auth`]: cookie session and the login / two-step verification state machine
//! - [`analytics`]: settings and time-series requests against the analytics API
//! - [`catalog`]: known measures and their destination tables
//! - [`store`]: the table store seam, BigQuery REST and in-memory implementations
//! - [`registry`]: idempotent table creation
//! - [`limiter`] and [`ingest`]: bounded, idempotent per-day loads
//! - [`export`]: fan-out over every metric and dimension of one app and day
//!
//! The `asa-export` binary wires them together through [`parse_cli`] and
//! [`run_with_parsed`].

pub mod analytics;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod export;
pub mod http;
pub mod ingest;
pub mod limiter;
pub mod logging;
pub mod registry;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use crate::analytics::{MetricsClient, RequestError};
use crate::auth::{AuthError, CredentialSession, SessionAuthenticator, provider_for};
use crate::config::{AppDefinition, ConfigError, Credentials, ExportConfig};
use crate::export::{ExportPlan, ExportSummary, PlanError, plan_exports, run_export};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::ingest::IngestionPipeline;
use crate::limiter::ConcurrencyLimiter;
use crate::logging::Redactions;
use crate::registry::{RegistryError, TableRegistry};
use crate::store::{BigQueryStore, MemoryStore, StoreError, TableStore};

#[derive(Parser, Debug, Clone)]
#[command(name = "asa-export", version, about = "Export App Store Connect analytics to BigQuery")]
pub struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true, env = "ASA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print results and errors as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Debug logging for this crate (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Export every metric of one day for one or all configured apps
    Export {
        /// Day to export (YYYY-MM-DD); defaults to yesterday (UTC)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// App name or id; repeat for several, omit for all configured apps
        #[arg(long = "app")]
        apps: Vec<String>,

        /// Truncate each table before loading instead of appending (single app only)
        #[arg(long)]
        overwrite: bool,

        /// Load into an in-memory store instead of BigQuery
        #[arg(long)]
        dry_run: bool,

        /// Two-step verification code (otherwise ASA_SECURITY_CODE or a prompt)
        #[arg(long)]
        code: Option<String>,
    },

    /// Print the analytics settings visible to the account
    Settings {
        /// Two-step verification code (otherwise ASA_SECURITY_CODE or a prompt)
        #[arg(long)]
        code: Option<String>,
    },

    /// Create every destination table that does not exist yet
    Tables {
        /// Resolve names and schemas without touching BigQuery
        #[arg(long)]
        dry_run: bool,
    },
}

/// A failure as reported by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct CliError {
    pub code: i32,
    pub kind: &'static str,
    pub message: String,
    pub hint: Option<String>,
    pub retryable: bool,
}

impl CliError {
    fn new(code: i32, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
            hint: None,
            retryable: false,
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::new(2, "config", err.to_string())
            .hint("Check the config file and the ASA_* / BIGQUERY_ACCESS_TOKEN variables.")
    }
}

impl From<AuthError> for CliError {
    fn from(err: AuthError) -> Self {
        let hint = err.suggestion();
        let retryable = err.is_retryable();
        CliError::new(4, "auth", err.to_string())
            .hint(hint)
            .retryable(retryable)
    }
}

impl From<RequestError> for CliError {
    fn from(err: RequestError) -> Self {
        let retryable = matches!(err.status(), Some(500..=599)) || matches!(err, RequestError::Transport(_));
        CliError::new(5, "request", err.to_string()).retryable(retryable)
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        CliError::new(6, "store", err.to_string())
            .hint("Check the project, dataset and BigQuery access token.")
            .retryable(true)
    }
}

impl From<RegistryError> for CliError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Store(err) => err.into(),
            other => CliError::new(1, "registry", other.to_string()),
        }
    }
}

impl From<PlanError> for CliError {
    fn from(err: PlanError) -> Self {
        let hint = err.suggestion();
        CliError::new(2, "usage", err.to_string()).hint(hint)
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::new(1, "internal", format!("{err:#}"))
    }
}

#[derive(Debug, Clone)]
pub struct ParsedCli {
    pub cli: Cli,
}

/// Parse arguments. Help and version output is printed here and reported as code 0.
pub fn parse_cli(raw_args: Vec<String>) -> Result<ParsedCli, CliError> {
    match Cli::try_parse_from(raw_args) {
        Ok(cli) => Ok(ParsedCli { cli }),
        Err(err) => {
            use clap::error::ErrorKind;
            if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                let _ = err.print();
                return Err(CliError::new(0, "help", String::new()));
            }
            Err(CliError::new(2, "usage", err.to_string().trim_end().to_string())
                .hint("Run `asa-export --help` for usage."))
        }
    }
}

pub async fn run_with_parsed(parsed: ParsedCli) -> Result<(), CliError> {
    let cli = parsed.cli;
    let redactions = logging::init(cli.verbose);
    let config = match &cli.config {
        Some(path) => ExportConfig::load_from(path)?,
        None => ExportConfig::load()?,
    };

    match cli.command {
        Commands::Export {
            date,
            apps,
            overwrite,
            dry_run,
            code,
        } => {
            let date = date.unwrap_or_else(yesterday);
            let apps = select_apps(&config, &apps)?;
            let plans = plan_exports(&apps, date, &config.dimensions, overwrite)?;
            let transport = Arc::new(ReqwestTransport::new()?);
            let session = login(&transport, &config, code, &redactions).await?;
            let client = Arc::new(MetricsClient::new(
                Arc::clone(&transport),
                session,
                config.endpoints.analytics_api_url.clone(),
            )?);

            let summaries = if dry_run {
                let store = Arc::new(MemoryStore::new());
                export_all(client, store, &config, &plans).await?
            } else {
                let token = crate::config::access_token_from_env()?;
                let store = Arc::new(BigQueryStore::new(transport, config.bigquery(token)));
                export_all(client, store, &config, &plans).await?
            };
            print_summaries(&summaries, cli.json);

            let failed: usize = summaries.iter().map(ExportSummary::failure_count).sum();
            if failed > 0 {
                return Err(CliError::new(
                    3,
                    "partial-export",
                    format!("{failed} export unit(s) failed"),
                )
                .hint("Re-run the same date; completed units are replaced, not duplicated.")
                .retryable(true));
            }
            Ok(())
        }
        Commands::Settings { code } => {
            let transport = Arc::new(ReqwestTransport::new()?);
            let session = login(&transport, &config, code, &redactions).await?;
            let client = MetricsClient::new(
                transport,
                session,
                config.endpoints.analytics_api_url.clone(),
            )?;
            let settings = client.get_settings().await?;
            let rendered = if cli.json {
                serde_json::to_string(&settings.settings)
            } else {
                serde_json::to_string_pretty(&settings.settings)
            }
            .map_err(anyhow::Error::from)?;
            println!("{rendered}");
            Ok(())
        }
        Commands::Tables { dry_run } => {
            let tables = if dry_run {
                ensure_all_tables(Arc::new(MemoryStore::new()), &config).await?
            } else {
                let transport = Arc::new(ReqwestTransport::new()?);
                let token = crate::config::access_token_from_env()?;
                ensure_all_tables(
                    Arc::new(BigQueryStore::new(transport, config.bigquery(token))),
                    &config,
                )
                .await?
            };
            if cli.json {
                println!("{}", serde_json::json!({ "tables": tables }));
            } else {
                for table in tables {
                    println!("{table}");
                }
            }
            Ok(())
        }
    }
}

fn yesterday() -> NaiveDate {
    Utc::now().date_naive() - ChronoDuration::days(1)
}

fn select_apps(
    config: &ExportConfig,
    requested: &[String],
) -> Result<Vec<AppDefinition>, CliError> {
    if requested.is_empty() {
        return Ok(config.apps.clone());
    }
    requested
        .iter()
        .map(|key| {
            config.find_app(key).cloned().ok_or_else(|| {
                CliError::new(2, "usage", format!("Unknown app: {key}"))
                    .hint("Use a name or id listed under [[apps]] in the config.")
            })
        })
        .collect()
}

async fn login<T: HttpTransport>(
    transport: &Arc<T>,
    config: &ExportConfig,
    code: Option<String>,
    redactions: &Redactions,
) -> Result<CredentialSession, CliError> {
    let credentials = Credentials::from_env()?;
    redactions.set(credentials.password.clone());
    let mut second_factor = provider_for(code.or_else(crate::config::security_code_from_env));
    let authenticator = SessionAuthenticator::new(Arc::clone(transport), config.endpoints.auth());
    let session = authenticator
        .authenticate(
            &credentials.username,
            &credentials.password,
            second_factor.as_mut(),
        )
        .await?;
    info!(cookies = session.len(), "signed in");
    Ok(session)
}

async fn export_all<T, S>(
    client: Arc<MetricsClient<T>>,
    store: Arc<S>,
    config: &ExportConfig,
    plans: &[ExportPlan],
) -> Result<Vec<ExportSummary>, CliError>
where
    T: HttpTransport + 'static,
    S: TableStore + 'static,
{
    store.ensure_dataset().await?;
    let registry = Arc::new(TableRegistry::new(store));
    let pipeline = IngestionPipeline::new(
        registry,
        ConcurrencyLimiter::new(config.max_concurrent_loads),
    );

    let mut summaries = Vec::with_capacity(plans.len());
    for plan in plans {
        summaries.push(run_export(Arc::clone(&client), pipeline.clone(), plan).await);
    }
    Ok(summaries)
}

async fn ensure_all_tables<S: TableStore>(
    store: Arc<S>,
    config: &ExportConfig,
) -> Result<Vec<String>, CliError> {
    store.ensure_dataset().await?;
    let registry = TableRegistry::new(store);
    let dimensions = std::iter::once(None).chain(config.dimensions.iter().map(|d| Some(d.as_str())));
    for dimension in dimensions {
        for metric in catalog::METRICS {
            registry.ensure_table(metric.id, dimension).await?;
        }
    }
    Ok(registry.ensured_tables())
}

fn print_summaries(summaries: &[ExportSummary], json: bool) {
    if json {
        println!("{}", serde_json::json!({ "exports": summaries }));
        return;
    }
    for summary in summaries {
        println!(
            "{} {}: {} rows in {} units, {} failed",
            summary.app,
            summary.date,
            summary.rows_loaded(),
            summary.units.len(),
            summary.failure_count()
        );
        for unit in summary.failed() {
            let dimension = unit.dimension.as_deref().unwrap_or("total");
            let error = unit.error.as_deref().unwrap_or_default();
            println!("  {} / {dimension}: {error}", unit.metric);
        }
    }
}
