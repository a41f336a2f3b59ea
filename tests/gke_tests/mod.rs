//! Live cluster tests
//!
//! - `cluster_metrics`: the resource consumer's container metrics show up in
//!   Cloud Monitoring with the expected CPU utilization (~5-8min)

mod cluster_metrics;
