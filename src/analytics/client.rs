//! Authenticated client for the App Store Connect analytics API.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use super::types::{MetricRequest, SettingsPayload, TimeSeriesPayload};
use crate::auth::CredentialSession;
use crate::http::{HttpRequest, HttpResponse, HttpTransport, TransportError};

pub const DEFAULT_API_BASE_URL: &str = "https://appstoreconnect.apple.com/analytics/api/v1";

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("analytics API returned {status}{}", provider_suffix(.provider_message))]
    Status {
        status: u16,
        provider_message: Option<String>,
    },

    #[error("analytics API requires an authenticated session; log in first")]
    Unauthenticated,

    #[error("analytics API returned an unexpected payload: {0}")]
    UnexpectedShape(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn provider_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

impl RequestError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Issues settings and time-series requests with the session's cookies.
pub struct MetricsClient<T> {
    transport: Arc<T>,
    session: CredentialSession,
    api_base_url: String,
}

impl<T: HttpTransport> MetricsClient<T> {
    /// Build a client around an established session.
    pub fn new(
        transport: Arc<T>,
        session: CredentialSession,
        api_base_url: impl Into<String>,
    ) -> Result<Self, RequestError> {
        if !session.is_usable() {
            return Err(RequestError::Unauthenticated);
        }
        Ok(Self {
            transport,
            session,
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn session(&self) -> &CredentialSession {
        &self.session
    }

    /// `GET settings/all`.
    pub async fn get_settings(&self) -> Result<SettingsPayload, RequestError> {
        let url = format!("{}/settings/all", self.api_base_url);
        let response = self.send(HttpRequest::get(url)).await?;
        decode(&response)
    }

    /// `POST data/time-series` for `request`, daily granularity.
    pub async fn get_metric(
        &self,
        request: &MetricRequest,
    ) -> Result<TimeSeriesPayload, RequestError> {
        let url = format!("{}/data/time-series", self.api_base_url);
        let body = serde_json::to_value(request.to_body())
            .map_err(|e| RequestError::UnexpectedShape(e.to_string()))?;
        debug!(
            app_id = request.app_id(),
            measures = ?request.measures(),
            dimension = request.dimension(),
            "fetching time series"
        );
        let response = self
            .send(
                HttpRequest::post(url)
                    .header("X-Requested-By", "dev.apple.com")
                    .json(body),
            )
            .await?;
        decode(&response)
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, RequestError> {
        let request = request.headers(self.session.request_headers());
        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            return Err(RequestError::Status {
                status: response.status,
                provider_message: provider_message(&response),
            });
        }
        Ok(response)
    }
}

fn decode<P: DeserializeOwned>(response: &HttpResponse) -> Result<P, RequestError> {
    response
        .json()
        .map_err(|e| RequestError::UnexpectedShape(e.to_string()))
}

/// Render the `errors` field of a JSON error body, if there is one.
fn provider_message(response: &HttpResponse) -> Option<String> {
    let value: serde_json::Value = response.json().ok()?;
    let errors = value.get("errors")?;
    let empty = match errors {
        serde_json::Value::Null => true,
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    };
    if empty {
        return None;
    }
    serde_json::to_string_pretty(errors).ok()
}
