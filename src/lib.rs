//! Metrics export e2e - verifies GKE container metrics reach Cloud Monitoring
//!
//! A resource consumer with a known CPU and memory load is deployed into the
//! cluster, then Cloud Monitoring is polled until every container metric for
//! it reports data and its CPU utilization matches the load.
//!
//! # Architecture
//!
//! The check is a single predicate ([`verify::MetricsVerifier::check_metrics`])
//! handed to a generic poll combinator ([`poll::poll_until`]). Everything it
//! talks to is injected through traits:
//! - [`monitoring::MetricsBackend`] for time series queries
//! - [`workload::WorkloadLifecycle`] for the synthetic workload
//! - [`monitoring::Clock`] for the query window
//!
//! so the whole flow runs against fakes in tests and against a live cluster
//! and project from the binary.
//!
//! # Modules
//!
//! - [`config`] - Expected metrics and poll cadence
//! - [`monitoring`] - Metric model, backend trait, Cloud Monitoring client
//! - [`credentials`] - OAuth access tokens for Cloud Monitoring
//! - [`poll`] - Poll-until-condition combinator
//! - [`verify`] - The metrics check
//! - [`workload`] - Resource consumer workload
//! - [`framework`] - Test context, provider gate, namespaces
//! - [`scenario`] - End-to-end "should have cluster metrics" flow
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod framework;
pub mod monitoring;
pub mod poll;
pub mod scenario;
pub mod telemetry;
pub mod verify;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
