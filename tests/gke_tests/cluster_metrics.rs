//! Stackdriver Monitoring: should have cluster metrics

use std::sync::Arc;

use metrics_export_e2e::credentials::default_token_source;
use metrics_export_e2e::framework::{
    create_client, skip_unless_provider_is, TestContext, TestNamespace,
};
use metrics_export_e2e::monitoring::{CloudMonitoringClient, SystemClock};
use metrics_export_e2e::scenario::{
    should_have_cluster_metrics, ScenarioOutcome, SCENARIO_NAME, SUPPORTED_PROVIDERS,
};
use metrics_export_e2e::workload::KubeWorkloads;

/// Story: a resource consumer's metrics reach Cloud Monitoring
///
/// A deployment burning 100m of a 200m CPU limit is created; within seven
/// minutes all nine container metrics must be queryable for it and the
/// reported CPU utilization must imply roughly 100m of usage.
#[tokio::test]
#[ignore = "requires GKE cluster - run with: cargo test --test gke -- --ignored"]
async fn story_cluster_exports_container_metrics() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let ctx = TestContext::from_env().expect("E2E_PROJECT_ID must be set");

    // An explicit non-GKE provider is a misconfigured run, not a pass
    assert_eq!(
        skip_unless_provider_is(&ctx, SUPPORTED_PROVIDERS),
        None,
        "E2E_PROVIDER must be gke for this test"
    );

    let tokens = default_token_source().expect("failed to build token source");
    let backend = CloudMonitoringClient::new(ctx.project_id.clone(), tokens)
        .expect("failed to create monitoring client");

    let client = create_client(ctx.kubeconfig.as_deref())
        .await
        .expect("failed to create kube client");
    let namespace = TestNamespace::create(client.clone(), SCENARIO_NAME)
        .await
        .expect("failed to create test namespace");
    let namespace_name = namespace.name().to_string();

    let outcome = should_have_cluster_metrics(
        &ctx,
        Arc::new(backend),
        Arc::new(KubeWorkloads::new(client, namespace.name())),
        Arc::new(SystemClock),
    )
    .await;

    if let Err(e) = namespace.delete().await {
        println!("  Failed to delete namespace {}: {}", namespace_name, e);
    }

    assert_eq!(
        outcome.expect("cluster metrics scenario failed"),
        ScenarioOutcome::Passed
    );
}
