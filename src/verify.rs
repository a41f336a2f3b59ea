//! Metrics verification check
//!
//! One call to [`MetricsVerifier::check_metrics`] re-fetches every expected
//! metric for the synthetic workload over `[start, now)` and decides whether
//! the export is complete:
//!
//! 1. every configured metric returned at least one series, and
//! 2. the utilization metric, reduced to one value per series and summed,
//!    implies a CPU usage within tolerance of the expected usage.
//!
//! Nothing is carried over between calls, so repeated checks against the same
//! backend state give the same answer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::config::{ExpectedMetrics, UtilizationAggregation};
use crate::monitoring::{Clock, MetricSeries, MetricsBackend, TimeSeriesQuery};
use crate::Result;

/// Utilization seen in one check
#[derive(Clone, Debug, PartialEq)]
pub struct UtilizationObservation {
    /// Number of series that contributed a value
    pub series: usize,
    /// Sum of the per-series representative values
    pub sum: f64,
    /// `sum` scaled by the CPU limit, in millicores
    pub implied_usage_millicores: f64,
    /// Whether `implied_usage_millicores` is within tolerance
    pub within_tolerance: bool,
}

/// Detailed outcome of one check
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsCheck {
    /// Metrics that returned at least one series
    pub present: Vec<String>,
    /// Metrics that returned nothing
    pub missing: Vec<String>,
    /// Utilization result, if the utilization metric had data
    pub utilization: Option<UtilizationObservation>,
}

impl MetricsCheck {
    /// All metrics present and utilization within tolerance
    pub fn is_satisfied(&self) -> bool {
        self.missing.is_empty()
            && self
                .utilization
                .as_ref()
                .is_some_and(|u| u.within_tolerance)
    }

    /// One-line summary for logs and timeout messages
    pub fn summary(&self) -> String {
        let utilization = match &self.utilization {
            Some(u) => format!(
                "utilization {:.3} (~{:.0}m, within tolerance: {})",
                u.sum, u.implied_usage_millicores, u.within_tolerance
            ),
            None => "no utilization data".to_string(),
        };

        if self.missing.is_empty() {
            format!("all {} metrics present, {}", self.present.len(), utilization)
        } else {
            format!("missing [{}], {}", self.missing.join(", "), utilization)
        }
    }
}

/// Reduce the utilization series to one summed value
///
/// Series with no numeric representative value contribute nothing.
pub fn aggregate_utilization(
    series: &[MetricSeries],
    aggregation: UtilizationAggregation,
) -> (usize, f64) {
    series
        .iter()
        .filter_map(|s| match aggregation {
            UtilizationAggregation::Latest => s.latest().and_then(|p| p.value),
            UtilizationAggregation::WindowMean => s.mean(),
        })
        .fold((0, 0.0), |(n, sum), v| (n + 1, sum + v))
}

/// Checks Cloud Monitoring for the synthetic workload's metrics
pub struct MetricsVerifier {
    backend: Arc<dyn MetricsBackend>,
    clock: Arc<dyn Clock>,
    expected: ExpectedMetrics,
}

impl MetricsVerifier {
    /// Create a verifier reading from `backend`
    pub fn new(
        backend: Arc<dyn MetricsBackend>,
        clock: Arc<dyn Clock>,
        expected: ExpectedMetrics,
    ) -> Self {
        Self {
            backend,
            clock,
            expected,
        }
    }

    /// Expected metrics this verifier checks for
    pub fn expected(&self) -> &ExpectedMetrics {
        &self.expected
    }

    /// Poll predicate: `Ok(true)` once the export is complete
    ///
    /// A fetch error for any metric aborts the check and is returned as is.
    pub async fn check_metrics(&self, start: DateTime<Utc>) -> Result<bool> {
        Ok(self.inspect(start).await?.is_satisfied())
    }

    /// Run one check and report what was found
    #[instrument(skip(self), fields(container = %self.expected.container_name))]
    pub async fn inspect(&self, start: DateTime<Utc>) -> Result<MetricsCheck> {
        let mut check = MetricsCheck::default();

        for metric in &self.expected.metric_names {
            let query = TimeSeriesQuery::for_container(
                &self.expected.metric_type(metric),
                &self.expected.container_name,
                start,
                self.clock.now(),
            );
            let series = self.backend.list_time_series(&query).await?;
            debug!(metric = %metric, series = series.len(), "Fetched time series");

            if series.is_empty() {
                check.missing.push(metric.clone());
            } else {
                check.present.push(metric.clone());
            }

            if *metric == self.expected.utilization_metric && !series.is_empty() {
                check.utilization = Some(self.observe_utilization(&series));
            }
        }

        info!(
            satisfied = check.is_satisfied(),
            "Metrics check: {}",
            check.summary()
        );
        Ok(check)
    }

    fn observe_utilization(&self, series: &[MetricSeries]) -> UtilizationObservation {
        let (contributing, sum) = aggregate_utilization(series, self.expected.aggregation);
        UtilizationObservation {
            series: contributing,
            sum,
            implied_usage_millicores: sum * self.expected.cpu_limit_millicores as f64,
            within_tolerance: self.expected.utilization_within_tolerance(sum),
        }
    }
}
