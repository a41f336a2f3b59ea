//! Cloud Monitoring v3 REST client
//!
//! Implements [`MetricsBackend`] with `GET /v3/projects/{project}/timeSeries`.
//! Responses are paged; every page is fetched before the series are returned so
//! that a metric split across pages is still seen in full.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{full_project_name, MetricSample, MetricSeries, MetricsBackend, TimeSeriesQuery};
use crate::credentials::TokenSource;
use crate::{Error, Result};

/// Public Cloud Monitoring endpoint
pub const DEFAULT_ENDPOINT: &str = "https://monitoring.googleapis.com";

/// Per-request timeout for monitoring calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the Cloud Monitoring time series API
pub struct CloudMonitoringClient {
    http: reqwest::Client,
    endpoint: String,
    project_id: String,
    tokens: Arc<dyn TokenSource>,
}

impl CloudMonitoringClient {
    /// Create a client for `project_id` authenticated by `tokens`
    pub fn new(project_id: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            project_id: project_id.into(),
            tokens,
        })
    }

    /// Point the client at a different endpoint (regional or test server)
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Project this client reads from
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn time_series_url(&self) -> String {
        format!(
            "{}/v3/{}/timeSeries",
            self.endpoint,
            full_project_name(&self.project_id)
        )
    }

    async fn fetch_page(
        &self,
        token: &str,
        query: &TimeSeriesQuery,
        page_token: Option<&str>,
    ) -> Result<ListTimeSeriesResponse> {
        let mut params = vec![
            ("filter", query.filter.clone()),
            ("interval.startTime", rfc3339(query.start)),
            ("interval.endTime", rfc3339(query.end)),
        ];
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token.to_string()));
        }

        let response = self
            .http
            .get(self.time_series_url())
            .bearer_auth(token)
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(Error::monitoring_api(status.as_u16(), error_message(&body)));
        }

        serde_json::from_str(&body).map_err(|e| {
            Error::serialization(format!("failed to decode timeSeries response: {}", e))
        })
    }
}

#[async_trait]
impl MetricsBackend for CloudMonitoringClient {
    #[instrument(skip(self), fields(project = %self.project_id))]
    async fn list_time_series(&self, query: &TimeSeriesQuery) -> Result<Vec<MetricSeries>> {
        let token = self.tokens.access_token().await?;

        let mut series = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let page = self
                .fetch_page(&token, query, page_token.as_deref())
                .await?;
            pages += 1;
            series.extend(page.time_series.into_iter().map(MetricSeries::from));

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        debug!(pages, series = series.len(), "Listed time series");
        Ok(series)
    }
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Pull the human-readable message out of a Google API error body
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTimeSeriesResponse {
    #[serde(default)]
    time_series: Vec<TimeSeries>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeSeries {
    #[serde(default)]
    metric: Metric,
    #[serde(default)]
    resource: MonitoredResource,
    #[serde(default)]
    points: Vec<Point>,
}

#[derive(Debug, Default, Deserialize)]
struct Metric {
    #[serde(rename = "type", default)]
    type_: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct MonitoredResource {
    #[serde(rename = "type", default)]
    type_: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Point {
    interval: TimeInterval,
    #[serde(default)]
    value: TypedValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeInterval {
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    end_time: DateTime<Utc>,
}

/// Only the numeric variants matter; int64 arrives as a JSON string
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypedValue {
    #[serde(default)]
    double_value: Option<f64>,
    #[serde(default)]
    int64_value: Option<String>,
}

impl TypedValue {
    fn as_f64(&self) -> Option<f64> {
        self.double_value.or_else(|| {
            self.int64_value
                .as_deref()
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v as f64)
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl From<TimeSeries> for MetricSeries {
    fn from(ts: TimeSeries) -> Self {
        let points = ts
            .points
            .into_iter()
            .map(|p| MetricSample {
                start_time: p.interval.start_time,
                end_time: p.interval.end_time,
                value: p.value.as_f64(),
            })
            .collect();

        Self {
            metric_type: ts.metric.type_,
            metric_labels: ts.metric.labels,
            resource_type: ts.resource.type_,
            resource_labels: ts.resource.labels,
            points,
        }
    }
}
