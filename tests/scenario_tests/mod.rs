//! Scenario tests against in-memory fakes
//!
//! - `fakes`: a mutable Cloud Monitoring stand-in and a cluster-free workload
//!   lifecycle
//! - `cluster_metrics`: stories covering arrival delay, missing metrics,
//!   utilization bands, backend errors, and cleanup guarantees

mod cluster_metrics;
mod fakes;
