//! Error types for the metrics export end-to-end test

use std::time::Duration;

use thiserror::Error;

/// Main error type for metrics verification
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Transport-level HTTP error talking to Cloud Monitoring or the metadata server
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Cloud Monitoring returned a non-success status
    #[error("monitoring API error (status {status}): {message}")]
    MonitoringApi {
        /// HTTP status code
        status: u16,
        /// Error message from the response body
        message: String,
    },

    /// Access token could not be obtained
    #[error("credentials error: {0}")]
    Credentials(String),

    /// Invalid run or expected-metrics configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Synthetic workload could not be created, observed, or removed
    #[error("workload error: {0}")]
    Workload(String),

    /// A poll did not reach its condition before the deadline
    #[error("timed out after {timeout:?} waiting for {description}")]
    Timeout {
        /// What was being waited for
        description: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a monitoring API error from a status code and message
    pub fn monitoring_api(status: u16, message: impl Into<String>) -> Self {
        Self::MonitoringApi {
            status,
            message: message.into(),
        }
    }

    /// Create a credentials error with the given message
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a workload error with the given message
    pub fn workload(msg: impl Into<String>) -> Self {
        Self::Workload(msg.into())
    }

    /// Create a timeout error for the given wait
    pub fn timeout(description: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            description: description.into(),
            timeout,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether this error is a poll deadline rather than a hard failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
