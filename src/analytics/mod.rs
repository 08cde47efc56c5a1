//! App Store Connect analytics API.
//!
//! - [`types`]: request builder, response payloads, metric rows
//! - [`client`]: authenticated settings and time-series calls

pub mod client;
pub mod types;

pub use client::{DEFAULT_API_BASE_URL, MetricsClient, RequestError};
pub use types::{
    MetricRequest, MetricRow, MetricValue, SettingsPayload, TimeSeriesBody, TimeSeriesPayload,
};
