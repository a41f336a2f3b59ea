//! Stories about the cluster metrics scenario against fake collaborators
//!
//! These run without a cluster or a Cloud project. Time is paused so the
//! full 7 minute budget elapses instantly.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use metrics_export_e2e::config::{ExpectedMetrics, PollSettings, CONTAINER_METRICS};
use metrics_export_e2e::framework::TestContext;
use metrics_export_e2e::scenario::{
    should_have_cluster_metrics, ClusterMetricsScenario, ScenarioOutcome,
};
use metrics_export_e2e::verify::MetricsVerifier;
use metrics_export_e2e::Error;

use super::fakes::{at, FakeMonitoring, FakeWorkloads, FrozenClock, SteppingClock};

fn gke() -> TestContext {
    TestContext {
        project_id: "e2e-project".to_string(),
        provider: "gke".to_string(),
        kubeconfig: None,
    }
}

fn scenario(
    monitoring: Arc<FakeMonitoring>,
    workloads: Arc<FakeWorkloads>,
) -> ClusterMetricsScenario {
    ClusterMetricsScenario::new(monitoring, workloads, Arc::new(FrozenClock(at(300))))
}

/// Story: metrics trickle in a few polls after the workload starts
///
/// Cloud Monitoring ingests container metrics with a delay. The scenario keeps
/// polling through the empty responses and passes once everything shows up.
#[tokio::test(start_paused = true)]
async fn story_metrics_arrive_after_ingestion_delay() {
    let monitoring = FakeMonitoring::new();
    // three full checks (27 queries) see nothing
    monitoring.publish_later(27, &CONTAINER_METRICS, 0.5);
    let (workloads, record) = FakeWorkloads::ready();

    let outcome = scenario(monitoring.clone(), workloads)
        .run(&gke())
        .await
        .expect("scenario should pass");

    assert_eq!(outcome, ScenarioOutcome::Passed);
    assert_eq!(monitoring.queries(), 36);
    assert_eq!(*record.waited_for.lock().unwrap(), vec![1]);
    assert!(record.cleaned_up.load(Ordering::SeqCst));

    let created = record.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].cpu_millicores, 100);
    assert_eq!(created[0].cpu_limit_millicores, 200);
}

/// Story: one metric is never exported
///
/// There is no way to tell "late" from "never"; the scenario burns the whole
/// budget and then fails with a timeout naming what is still missing.
#[tokio::test(start_paused = true)]
async fn story_missing_metric_times_out_after_full_budget() {
    let monitoring = FakeMonitoring::new();
    let without_uptime: Vec<&str> = CONTAINER_METRICS
        .iter()
        .copied()
        .filter(|m| *m != "uptime")
        .collect();
    monitoring.publish_all(&without_uptime, 0.5);
    let (workloads, record) = FakeWorkloads::ready();

    let started = tokio::time::Instant::now();
    let err = scenario(monitoring.clone(), workloads)
        .run(&gke())
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(err.to_string().contains("missing [uptime]"));
    assert!(started.elapsed() <= Duration::from_secs(7 * 60));
    // 84 checks of 9 metrics each
    assert_eq!(monitoring.queries(), 84 * 9);
    assert!(record.cleaned_up.load(Ordering::SeqCst));
}

/// Story: usage is reported but far from what the consumer burns
#[tokio::test(start_paused = true)]
async fn story_wrong_utilization_fails() {
    let monitoring = FakeMonitoring::new();
    // 0.2 * 200m = 40m, expected 100m +/- 25m
    monitoring.publish_all(&CONTAINER_METRICS, 0.2);
    let (workloads, _) = FakeWorkloads::ready();

    let err = scenario(monitoring, workloads)
        .with_poll(PollSettings {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        })
        .run(&gke())
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(err.to_string().contains("within tolerance: false"));
}

/// Story: two replicas split the load across two series
#[tokio::test(start_paused = true)]
async fn story_utilization_is_summed_across_replicas() {
    let monitoring = FakeMonitoring::new();
    let others: Vec<&str> = CONTAINER_METRICS
        .iter()
        .copied()
        .filter(|m| *m != "cpu/utilization")
        .collect();
    monitoring.publish_all(&others, 0.0);
    // each replica's latest sample is 0.25; the stale 0.9 must be ignored
    monitoring.publish("cpu/utilization", &[(60, 0.9), (120, 0.25)]);
    monitoring.publish("cpu/utilization", &[(120, 0.25)]);
    let (workloads, _) = FakeWorkloads::ready();

    let expected = ExpectedMetrics {
        replicas: 2,
        ..Default::default()
    };
    let outcome = scenario(monitoring, workloads)
        .with_expected(expected)
        .run(&gke())
        .await
        .unwrap();
    assert_eq!(outcome, ScenarioOutcome::Passed);
}

/// Story: the monitoring API starts rejecting requests
///
/// Fetch errors are not retried within the polling window: the first one
/// fails the scenario.
#[tokio::test(start_paused = true)]
async fn story_backend_error_fails_immediately() {
    let monitoring = FakeMonitoring::new();
    monitoring.fail_with("service unavailable");
    let (workloads, record) = FakeWorkloads::ready();

    let err = scenario(monitoring.clone(), workloads)
        .run(&gke())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MonitoringApi { status: 503, .. }));
    assert_eq!(monitoring.queries(), 1);
    assert!(record.cleaned_up.load(Ordering::SeqCst));
}

/// Story: the consumer pods never become ready
#[tokio::test]
async fn story_workload_not_ready_skips_polling() {
    let monitoring = FakeMonitoring::new();
    let (workloads, record) = FakeWorkloads::never_ready();

    let err = scenario(monitoring.clone(), workloads)
        .run(&gke())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Workload(_)));
    assert_eq!(monitoring.queries(), 0);
    assert!(record.cleaned_up.load(Ordering::SeqCst));
}

/// Story: running against a non-GKE cluster is a skip, not a failure
#[tokio::test]
async fn story_non_gke_cluster_is_skipped() {
    let monitoring = FakeMonitoring::new();
    let (workloads, record) = FakeWorkloads::ready();
    let ctx = TestContext {
        provider: "kind".to_string(),
        ..gke()
    };

    let outcome = should_have_cluster_metrics(
        &ctx,
        monitoring.clone(),
        workloads,
        Arc::new(FrozenClock(at(300))),
    )
    .await
    .unwrap();

    assert!(matches!(outcome, ScenarioOutcome::Skipped(_)));
    assert_eq!(monitoring.queries(), 0);
    assert!(record.created.lock().unwrap().is_empty());
}

/// Story: checking twice without new data gives the same answer
#[tokio::test]
async fn story_check_is_a_pure_function_of_backend_state() {
    let monitoring = FakeMonitoring::new();
    monitoring.publish_all(&CONTAINER_METRICS, 0.5);
    let verifier = MetricsVerifier::new(
        monitoring.clone(),
        Arc::new(FrozenClock(at(300))),
        ExpectedMetrics::default(),
    );

    let first = verifier.inspect(at(0)).await.unwrap();
    let second = verifier.inspect(at(0)).await.unwrap();
    assert_eq!(first, second);
    assert!(verifier.check_metrics(at(0)).await.unwrap());
}

/// Story: the query window opens only once the consumer is ready
///
/// Rolling out the consumer takes a while. Samples from before it was ready
/// would not reflect the load, so every query starts at the instant the
/// replica wait returned and ends at the clock reading of that query.
#[tokio::test(start_paused = true)]
async fn story_query_window_starts_after_replicas_are_ready() {
    let monitoring = FakeMonitoring::new();
    monitoring.publish_all(&CONTAINER_METRICS, 0.5);
    let clock = SteppingClock::new();
    let (workloads, _) = FakeWorkloads::ready_at(clock.clone(), 900);

    let outcome = ClusterMetricsScenario::new(monitoring.clone(), workloads, clock)
        .run(&gke())
        .await
        .unwrap();
    assert_eq!(outcome, ScenarioOutcome::Passed);

    let windows = monitoring.windows();
    assert_eq!(windows.len(), 9);
    for (i, (start, end)) in windows.iter().enumerate() {
        assert_eq!(*start, at(900));
        assert_eq!(*end, at(901 + i as i64));
    }
}
