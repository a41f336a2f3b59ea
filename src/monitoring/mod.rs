//! Monitoring backend abstraction
//!
//! The poller only needs one read operation from the monitoring backend:
//! list the time series matching a filter over a time window. It is modelled by
//! [`MetricsBackend`] so the check can run against Cloud Monitoring in
//! production and against mocks or in-memory fakes in tests.

pub mod gcm;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[cfg(test)]
use mockall::automock;

use crate::Result;

pub use gcm::CloudMonitoringClient;

/// One data point of a time series
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    /// Start of the sampling interval (absent for gauges)
    pub start_time: Option<DateTime<Utc>>,
    /// End of the sampling interval
    pub end_time: DateTime<Utc>,
    /// Numeric value, if the point carries one
    pub value: Option<f64>,
}

impl MetricSample {
    /// Gauge sample ending at `end_time`
    pub fn gauge(end_time: DateTime<Utc>, value: f64) -> Self {
        Self {
            start_time: None,
            end_time,
            value: Some(value),
        }
    }
}

/// Samples of one metric from one monitored resource
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricSeries {
    /// Full metric type
    pub metric_type: String,
    /// Metric labels
    pub metric_labels: BTreeMap<String, String>,
    /// Monitored resource type (e.g. `gke_container`)
    pub resource_type: String,
    /// Monitored resource labels (e.g. `container_name`)
    pub resource_labels: BTreeMap<String, String>,
    /// Samples in the order the backend returned them
    pub points: Vec<MetricSample>,
}

impl MetricSeries {
    /// Sample with the latest interval end time
    ///
    /// When several samples share the latest end time the first one wins.
    pub fn latest(&self) -> Option<&MetricSample> {
        let mut points = self.points.iter();
        let mut latest = points.next()?;
        for point in points {
            if point.end_time > latest.end_time {
                latest = point;
            }
        }
        Some(latest)
    }

    /// Mean of all numeric samples
    pub fn mean(&self) -> Option<f64> {
        let values: Vec<f64> = self.points.iter().filter_map(|p| p.value).collect();
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// A `projects.timeSeries.list` request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeSeriesQuery {
    /// Monitoring filter expression
    pub filter: String,
    /// Inclusive start of the window
    pub start: DateTime<Utc>,
    /// End of the window
    pub end: DateTime<Utc>,
}

impl TimeSeriesQuery {
    /// Query for one metric type of one container over `[start, end)`
    pub fn for_container(
        metric_type: &str,
        container_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            filter: metric_filter(metric_type, container_name),
            start,
            end,
        }
    }
}

/// Read access to a metrics backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// List every series matching the query, in backend order
    async fn list_time_series(&self, query: &TimeSeriesQuery) -> Result<Vec<MetricSeries>>;
}

/// Source of the current time
///
/// The end of each query window comes from here, which keeps the check
/// deterministic under test.
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Filter selecting one metric type for one container
pub fn metric_filter(metric_type: &str, container_name: &str) -> String {
    format!(
        r#"metric.type="{}" AND resource.label.container_name="{}""#,
        metric_type, container_name
    )
}

/// Resource name of a Cloud project
pub fn full_project_name(project_id: &str) -> String {
    format!("projects/{}", project_id)
}
