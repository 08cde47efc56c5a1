//! Request and response shapes of the analytics API.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Number of dimension values the portal ranks when grouping.
pub const GROUP_LIMIT: u32 = 10;

/// What to fetch: one app, one or more measures, optional grouping, a date range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRequest {
    app_id: String,
    measures: Vec<String>,
    dimension: Option<String>,
    start: NaiveDate,
    end: NaiveDate,
}

impl MetricRequest {
    pub fn new(
        app_id: impl Into<String>,
        measure: impl Into<String>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            measures: vec![measure.into()],
            dimension: None,
            start,
            end,
        }
    }

    /// Request several measures at once. An empty list falls back to `measure`.
    pub fn with_measures<I, S>(mut self, measures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let measures: Vec<String> = measures.into_iter().map(Into::into).collect();
        if !measures.is_empty() {
            self.measures = measures;
        }
        self
    }

    pub fn with_dimension(mut self, dimension: Option<impl Into<String>>) -> Self {
        self.dimension = dimension.map(Into::into);
        self
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn measures(&self) -> &[String] {
        &self.measures
    }

    /// The measure used for ranking and row extraction.
    pub fn primary_measure(&self) -> &str {
        &self.measures[0]
    }

    pub fn dimension(&self) -> Option<&str> {
        self.dimension.as_deref()
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Wire body for `POST data/time-series`.
    pub fn to_body(&self) -> TimeSeriesBody {
        TimeSeriesBody {
            adam_id: vec![self.app_id.clone()],
            measures: self.measures.clone(),
            group: self.dimension.as_ref().map(|dimension| GroupClause {
                dimension: dimension.clone(),
                metric: self.primary_measure().to_string(),
                limit: GROUP_LIMIT,
                rank: "DESCENDING".to_string(),
            }),
            frequency: "day".to_string(),
            start_time: midnight_utc(self.start),
            end_time: midnight_utc(self.end),
        }
    }
}

fn midnight_utc(date: NaiveDate) -> String {
    format!("{}T00:00:00Z", date.format("%Y-%m-%d"))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesBody {
    pub adam_id: Vec<String>,
    pub measures: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupClause>,
    pub frequency: String,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupClause {
    pub dimension: String,
    pub metric: String,
    pub limit: u32,
    pub rank: String,
}

/// The portal sends `null` where a list is empty.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `GET settings/all` response. The portal's settings are kept as raw JSON.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SettingsPayload {
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<Value>,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

/// `POST data/time-series` response.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TimeSeriesPayload {
    #[serde(default, deserialize_with = "null_as_default")]
    pub results: Vec<SeriesResult>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<Value>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResult {
    #[serde(default)]
    pub adam_id: Option<String>,
    #[serde(default)]
    pub group: Option<SeriesGroup>,
    #[serde(default)]
    pub data: Vec<SeriesPoint>,
}

/// The dimension value a grouped series belongs to.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SeriesGroup {
    #[serde(default)]
    pub key: Option<Value>,
    #[serde(default)]
    pub title: Option<String>,
}

impl SeriesGroup {
    pub fn label(&self) -> Option<String> {
        if let Some(title) = self.title.as_deref().filter(|t| !t.is_empty()) {
            return Some(title.to_string());
        }
        match &self.key {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SeriesPoint {
    pub date: String,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

/// Integer or floating-point metric value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    fn from_json(value: &Value) -> Option<Self> {
        let Value::Number(number) = value else {
            return None;
        };
        if let Some(i) = number.as_i64() {
            Some(Self::Int(i))
        } else {
            number.as_f64().map(Self::Float)
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

/// One daily value, optionally labelled with a dimension value.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub date: NaiveDate,
    pub value: MetricValue,
    pub dimension: Option<String>,
}

impl MetricRow {
    pub fn new(date: NaiveDate, value: MetricValue, dimension: Option<impl Into<String>>) -> Self {
        Self {
            date,
            value,
            dimension: dimension.map(Into::into),
        }
    }
}

impl TimeSeriesPayload {
    /// Flatten every series into rows for `measure`.
    ///
    /// Points lacking the measure or carrying an unparseable date are skipped.
    /// Rows of grouped series carry the group label.
    pub fn rows(&self, measure: &str) -> Vec<MetricRow> {
        let mut rows = Vec::new();
        for result in &self.results {
            let label = result.group.as_ref().and_then(SeriesGroup::label);
            for point in &result.data {
                let Some(date) = parse_point_date(&point.date) else {
                    continue;
                };
                let Some(value) = point.values.get(measure).and_then(MetricValue::from_json)
                else {
                    continue;
                };
                rows.push(MetricRow {
                    date,
                    value,
                    dimension: label.clone(),
                });
            }
        }
        rows
    }
}

/// Parse `2024-01-01T00:00:00Z` (or a bare `2024-01-01`) into a date.
fn parse_point_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}
