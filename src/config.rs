//! Export configuration.
//!
//! Settings live in a TOML file (default `$XDG_CONFIG_HOME/app-store-analytics/config.toml`)
//! and can be overridden through environment variables, which `dotenvy` also
//! reads from a `.env` file. Secrets are only ever taken from the environment.
//!
//! ```toml
//! project_id = "analytics-prod"
//! dataset_id = "apple_app_store_exported"
//! max_concurrent_loads = 50
//! dimensions = ["app_referrer", "region"]
//!
//! [[apps]]
//! id = "1055677337"
//! name = "Focus"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analytics::DEFAULT_API_BASE_URL;
use crate::auth::AuthEndpoints;
use crate::catalog::{ALL_DIMENSIONS, DEFAULT_DIMENSIONS};
use crate::limiter::DEFAULT_MAX_CONCURRENT_LOADS;
use crate::store::BigQueryConfig;
use crate::store::bigquery::{DEFAULT_API_BASE_URL as BIGQUERY_API_URL, DEFAULT_UPLOAD_BASE_URL};

pub const ENV_USERNAME: &str = "ASA_USERNAME";
pub const ENV_PASSWORD: &str = "ASA_PASSWORD";
pub const ENV_SECURITY_CODE: &str = "ASA_SECURITY_CODE";
pub const ENV_PROJECT_ID: &str = "ASA_PROJECT_ID";
pub const ENV_DATASET_ID: &str = "ASA_DATASET_ID";
pub const ENV_MAX_CONCURRENT_LOADS: &str = "ASA_MAX_CONCURRENT_LOADS";
pub const ENV_ACCESS_TOKEN: &str = "BIGQUERY_ACCESS_TOKEN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// An app to export, as listed in App Store Connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDefinition {
    /// Apple id of the app (`adamId`).
    pub id: String,
    /// Name written into the `app_name` column.
    pub name: String,
}

impl AppDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub auth_base_url: String,
    pub session_url: String,
    pub widget_key: String,
    pub analytics_api_url: String,
    pub bigquery_api_url: String,
    pub bigquery_upload_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        let auth = AuthEndpoints::default();
        Self {
            auth_base_url: auth.auth_base_url,
            session_url: auth.session_url,
            widget_key: auth.widget_key,
            analytics_api_url: DEFAULT_API_BASE_URL.to_string(),
            bigquery_api_url: BIGQUERY_API_URL.to_string(),
            bigquery_upload_url: DEFAULT_UPLOAD_BASE_URL.to_string(),
        }
    }
}

impl Endpoints {
    pub fn auth(&self) -> AuthEndpoints {
        AuthEndpoints {
            auth_base_url: self.auth_base_url.clone(),
            session_url: self.session_url.clone(),
            widget_key: self.widget_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub project_id: String,
    pub dataset_id: String,
    pub location: Option<String>,
    pub max_concurrent_loads: usize,
    pub poll_interval_ms: u64,
    /// Dimensions exported next to the per-metric totals.
    pub dimensions: Vec<String>,
    pub apps: Vec<AppDefinition>,
    pub endpoints: Endpoints,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            dataset_id: "apple_app_store_exported".to_string(),
            location: None,
            max_concurrent_loads: DEFAULT_MAX_CONCURRENT_LOADS,
            poll_interval_ms: 1000,
            dimensions: DEFAULT_DIMENSIONS.iter().map(|d| d.to_string()).collect(),
            apps: default_apps(),
            endpoints: Endpoints::default(),
        }
    }
}

fn default_apps() -> Vec<AppDefinition> {
    [
        ("989804926", "Firefox"),
        ("1489407738", "VPN"),
        ("1295998056", "WebXRViewer"),
        ("1314000270", "Lockwise"),
        ("1073435754", "Klar"),
        ("1055677337", "Focus"),
    ]
    .into_iter()
    .map(|(id, name)| AppDefinition::new(id, name))
    .collect()
}

impl ExportConfig {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path` (a missing file means defaults), then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(xdg_config) = dotenvy::var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg_config)
                .join("app-store-analytics")
                .join("config.toml"));
        }
        dirs::config_dir()
            .map(|p| p.join("app-store-analytics").join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(project_id) = dotenvy::var(ENV_PROJECT_ID) {
            self.project_id = project_id;
        }
        if let Ok(dataset_id) = dotenvy::var(ENV_DATASET_ID) {
            self.dataset_id = dataset_id;
        }
        if let Ok(raw) = dotenvy::var(ENV_MAX_CONCURRENT_LOADS) {
            self.max_concurrent_loads = raw.trim().parse().map_err(|_| {
                ConfigError::Validation(format!(
                    "{ENV_MAX_CONCURRENT_LOADS} must be a positive integer, got {raw:?}"
                ))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Missing("project_id"));
        }
        if self.dataset_id.trim().is_empty() {
            return Err(ConfigError::Missing("dataset_id"));
        }
        if self.max_concurrent_loads == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_loads must be at least 1".to_string(),
            ));
        }
        for dimension in &self.dimensions {
            if !ALL_DIMENSIONS.contains(&dimension.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Unknown dimension: {dimension}"
                )));
            }
        }
        let mut seen = HashSet::new();
        for app in &self.apps {
            if app.name.trim().is_empty() || app.id.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Apps need both an id and a name".to_string(),
                ));
            }
            if !seen.insert(&app.name) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate app name: {}",
                    app.name
                )));
            }
        }
        Ok(())
    }

    /// Find an app by name (case-insensitive) or id.
    pub fn find_app(&self, key: &str) -> Option<&AppDefinition> {
        self.apps
            .iter()
            .find(|app| app.id == key || app.name.eq_ignore_ascii_case(key))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn bigquery(&self, access_token: impl Into<String>) -> BigQueryConfig {
        BigQueryConfig {
            project_id: self.project_id.clone(),
            dataset_id: self.dataset_id.clone(),
            location: self.location.clone(),
            api_base_url: self.endpoints.bigquery_api_url.clone(),
            upload_base_url: self.endpoints.bigquery_upload_url.clone(),
            access_token: access_token.into(),
            poll_interval: self.poll_interval(),
        }
    }
}

/// Portal credentials, read from the environment only.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        let username = dotenvy::var(ENV_USERNAME).map_err(|_| ConfigError::Missing(ENV_USERNAME))?;
        let password = dotenvy::var(ENV_PASSWORD).map_err(|_| ConfigError::Missing(ENV_PASSWORD))?;
        Ok(Self { username, password })
    }
}

/// Security code supplied up front, if any.
pub fn security_code_from_env() -> Option<String> {
    dotenvy::var(ENV_SECURITY_CODE)
        .ok()
        .filter(|code| !code.trim().is_empty())
}

pub fn access_token_from_env() -> Result<String, ConfigError> {
    dotenvy::var(ENV_ACCESS_TOKEN).map_err(|_| ConfigError::Missing(ENV_ACCESS_TOKEN))
}
