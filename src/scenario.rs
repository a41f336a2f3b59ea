//! "Stackdriver Monitoring: should have cluster metrics"
//!
//! Creates a resource consumer with a known load, waits for it to be ready,
//! then polls Cloud Monitoring until every container metric for it is present
//! and its CPU utilization matches the load. The consumer is always cleaned up
//! once it has been created.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::config::{ExpectedMetrics, PollSettings};
use crate::framework::{skip_unless_provider_is, TestContext};
use crate::monitoring::{Clock, MetricsBackend};
use crate::poll::poll_until;
use crate::verify::MetricsVerifier;
use crate::workload::{WorkloadHandle, WorkloadLifecycle};
use crate::{Error, Result};

/// Base name of the namespace the scenario runs in
pub const SCENARIO_NAME: &str = "stackdriver-monitoring";

/// Providers that export container metrics to Cloud Monitoring
pub const SUPPORTED_PROVIDERS: &[&str] = &["gke"];

/// How a scenario run ended, when it did not fail
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScenarioOutcome {
    /// All metrics arrived with the expected utilization
    Passed,
    /// The environment does not support the scenario
    Skipped(String),
}

/// Wiring for one run of the cluster metrics scenario
pub struct ClusterMetricsScenario {
    backend: Arc<dyn MetricsBackend>,
    workloads: Arc<dyn WorkloadLifecycle>,
    clock: Arc<dyn Clock>,
    expected: ExpectedMetrics,
    poll: PollSettings,
}

impl ClusterMetricsScenario {
    /// Scenario with the default expectations and poll cadence
    pub fn new(
        backend: Arc<dyn MetricsBackend>,
        workloads: Arc<dyn WorkloadLifecycle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            workloads,
            clock,
            expected: ExpectedMetrics::default(),
            poll: PollSettings::default(),
        }
    }

    /// Override the expected metrics
    pub fn with_expected(mut self, expected: ExpectedMetrics) -> Self {
        self.expected = expected;
        self
    }

    /// Override the poll cadence
    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Run the scenario
    pub async fn run(&self, ctx: &TestContext) -> Result<ScenarioOutcome> {
        if let Some(reason) = skip_unless_provider_is(ctx, SUPPORTED_PROVIDERS) {
            info!(reason = %reason, "Skipping cluster metrics scenario");
            return Ok(ScenarioOutcome::Skipped(reason));
        }

        self.expected.validate()?;
        self.poll.validate()?;

        let consumer = self
            .workloads
            .create(&self.expected.consumer_spec())
            .await?;

        let result = self.exercise(consumer.as_ref()).await;
        let cleanup = consumer.clean_up().await;

        match (result, cleanup) {
            (Ok(()), Ok(())) => Ok(ScenarioOutcome::Passed),
            (Ok(()), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup_err)) => {
                warn!(error = %cleanup_err, "Cleanup failed after scenario failure");
                Err(e)
            }
        }
    }

    async fn exercise(&self, consumer: &dyn WorkloadHandle) -> Result<()> {
        consumer.wait_for_replicas(self.expected.replicas).await?;

        let verifier = MetricsVerifier::new(
            self.backend.clone(),
            self.clock.clone(),
            self.expected.clone(),
        );
        let start = self.clock.now();
        let last_summary = Mutex::new(String::from("no check completed"));

        info!(
            start = %start,
            interval = ?self.poll.interval,
            timeout = ?self.poll.timeout,
            "Polling for container metrics"
        );

        let verifier = &verifier;
        let last = &last_summary;
        let polled = poll_until(
            self.poll.interval,
            self.poll.timeout,
            "container metrics",
            move || async move {
                let check = verifier.inspect(start).await?;
                if let Ok(mut summary) = last.lock() {
                    *summary = check.summary();
                }
                Ok(check.is_satisfied())
            },
        )
        .await;

        match polled {
            Err(Error::Timeout {
                description,
                timeout,
            }) => {
                let summary = last_summary
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_default();
                Err(Error::timeout(
                    format!("{} (last check: {})", description, summary),
                    timeout,
                ))
            }
            other => other,
        }
    }
}

/// Run the scenario with default expectations and poll cadence
pub async fn should_have_cluster_metrics(
    ctx: &TestContext,
    backend: Arc<dyn MetricsBackend>,
    workloads: Arc<dyn WorkloadLifecycle>,
    clock: Arc<dyn Clock>,
) -> Result<ScenarioOutcome> {
    ClusterMetricsScenario::new(backend, workloads, clock)
        .run(ctx)
        .await
}
