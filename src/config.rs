//! Expected metrics configuration
//!
//! The constants below describe what the synthetic workload consumes and which
//! container metrics Cloud Monitoring must report for it. They are fixed for a
//! test run; [`ExpectedMetrics::default`] reproduces them and
//! [`ExpectedMetrics::validate`] guards hand-built variants.

use std::collections::HashSet;
use std::time::Duration;

use crate::workload::{ResourceConsumerSpec, WorkloadKind};
use crate::{Error, Result};

/// Container metrics exported by GKE, relative to [`METRIC_TYPE_PREFIX`]
pub const CONTAINER_METRICS: [&str; 9] = [
    "uptime",
    "memory/bytes_total",
    "memory/bytes_used",
    "cpu/reserved_cores",
    "cpu/usage_time",
    "memory/page_fault_count",
    "disk/bytes_used",
    "disk/bytes_total",
    "cpu/utilization",
];

/// Prefix turning a container metric name into a full metric type
pub const METRIC_TYPE_PREFIX: &str = "container.googleapis.com/container/";

/// Metric whose value is checked against the expected CPU usage
pub const UTILIZATION_METRIC: &str = "cpu/utilization";

/// Name of the synthetic workload and of its container
pub const RESOURCE_CONSUMER_NAME: &str = "resource-consumer";

/// Time between metric checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Overall budget for the metrics to appear
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(7 * 60);

/// Longest poll budget accepted
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// How a series is reduced to one representative utilization value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UtilizationAggregation {
    /// Value of the sample with the latest interval end time
    #[default]
    Latest,
    /// Mean of every numeric sample in the query window
    WindowMean,
}

/// What the test expects Cloud Monitoring to report
#[derive(Clone, Debug, PartialEq)]
pub struct ExpectedMetrics {
    /// Metric names that must each return at least one series
    pub metric_names: Vec<String>,
    /// Prefix prepended to each name to form the metric type
    pub metric_type_prefix: String,
    /// Name (from `metric_names`) whose value is range-checked
    pub utilization_metric: String,
    /// Container name the series are filtered on
    pub container_name: String,
    /// Workload replicas
    pub replicas: i32,
    /// CPU the workload consumes, in millicores
    pub cpu_used_millicores: i64,
    /// CPU limit of the workload, in millicores
    pub cpu_limit_millicores: i64,
    /// Memory the workload consumes, in megabytes
    pub memory_used_megabytes: i64,
    /// Memory limit of the workload, in megabytes
    pub memory_limit_megabytes: i64,
    /// Accepted relative deviation of the measured CPU usage
    pub tolerance: f64,
    /// Reduction applied to utilization series
    pub aggregation: UtilizationAggregation,
}

impl Default for ExpectedMetrics {
    fn default() -> Self {
        Self {
            metric_names: CONTAINER_METRICS.iter().map(|m| m.to_string()).collect(),
            metric_type_prefix: METRIC_TYPE_PREFIX.to_string(),
            utilization_metric: UTILIZATION_METRIC.to_string(),
            container_name: RESOURCE_CONSUMER_NAME.to_string(),
            replicas: 1,
            cpu_used_millicores: 100,
            cpu_limit_millicores: 200,
            memory_used_megabytes: 64,
            memory_limit_megabytes: 200,
            tolerance: 0.25,
            aggregation: UtilizationAggregation::Latest,
        }
    }
}

impl ExpectedMetrics {
    /// Check the configuration is internally consistent
    pub fn validate(&self) -> Result<()> {
        if self.metric_names.is_empty() {
            return Err(Error::config("at least one metric name is required"));
        }

        let mut seen = HashSet::new();
        for name in &self.metric_names {
            if !seen.insert(name.as_str()) {
                return Err(Error::config(format!("duplicate metric name '{}'", name)));
            }
        }

        if !seen.contains(self.utilization_metric.as_str()) {
            return Err(Error::config(format!(
                "utilization metric '{}' is not in the metric list",
                self.utilization_metric
            )));
        }

        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(Error::config(format!(
                "tolerance must be a non-negative number, got {}",
                self.tolerance
            )));
        }

        if self.cpu_used_millicores <= 0 || self.cpu_limit_millicores <= 0 {
            return Err(Error::config("cpu usage and cpu limit must be positive"));
        }

        if self.replicas <= 0 {
            return Err(Error::config("replicas must be positive"));
        }

        Ok(())
    }

    /// Full metric type for a configured metric name
    pub fn metric_type(&self, metric: &str) -> String {
        format!("{}{}", self.metric_type_prefix, metric)
    }

    /// Accepted absolute deviation, in millicores
    pub fn allowed_deviation(&self) -> f64 {
        self.tolerance * self.cpu_used_millicores as f64
    }

    /// Whether a summed utilization fraction matches the expected usage
    pub fn utilization_within_tolerance(&self, utilization: f64) -> bool {
        let used = utilization * self.cpu_limit_millicores as f64;
        (used - self.cpu_used_millicores as f64).abs() <= self.allowed_deviation()
    }

    /// Synthetic workload that produces the expected load
    pub fn consumer_spec(&self) -> ResourceConsumerSpec {
        ResourceConsumerSpec {
            name: self.container_name.clone(),
            kind: WorkloadKind::Deployment,
            replicas: self.replicas,
            cpu_millicores: self.cpu_used_millicores,
            memory_megabytes: self.memory_used_megabytes,
            cpu_limit_millicores: self.cpu_limit_millicores,
            memory_limit_megabytes: self.memory_limit_megabytes,
        }
    }
}

/// Cadence of the metrics poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    /// Time between checks
    pub interval: Duration,
    /// Overall deadline
    pub timeout: Duration,
}

impl PollSettings {
    /// Reject cadences that would hammer the backend or never check at all
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::config("poll interval must be positive"));
        }

        if self.interval > self.timeout {
            return Err(Error::config(format!(
                "poll interval {:?} exceeds timeout {:?}",
                self.interval, self.timeout
            )));
        }

        if self.timeout > MAX_POLL_TIMEOUT {
            return Err(Error::config(format!(
                "poll timeout {:?} exceeds maximum {:?}",
                self.timeout, MAX_POLL_TIMEOUT
            )));
        }

        Ok(())
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}
