//! Metrics export e2e runner

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use metrics_export_e2e::config::{
    ExpectedMetrics, PollSettings, UtilizationAggregation, DEFAULT_POLL_INTERVAL,
    DEFAULT_POLL_TIMEOUT,
};
use metrics_export_e2e::credentials::default_token_source;
use metrics_export_e2e::framework::{
    create_client, skip_unless_provider_is, TestContext, TestNamespace, DEFAULT_PROVIDER,
    PROJECT_ID_ENV, PROVIDER_ENV,
};
use metrics_export_e2e::monitoring::gcm::DEFAULT_ENDPOINT;
use metrics_export_e2e::monitoring::{CloudMonitoringClient, SystemClock};
use metrics_export_e2e::scenario::{
    ClusterMetricsScenario, ScenarioOutcome, SCENARIO_NAME, SUPPORTED_PROVIDERS,
};
use metrics_export_e2e::telemetry::{init_logging, LogFormat};
use metrics_export_e2e::workload::{KubeWorkloads, RESOURCE_CONSUMER_IMAGE};

/// Verify that container metrics from a GKE cluster reach Cloud Monitoring
#[derive(Parser, Debug)]
#[command(name = "metrics-export-e2e", version, about, long_about = None)]
struct Cli {
    /// Cloud project that receives the cluster's metrics
    #[arg(long, env = PROJECT_ID_ENV)]
    project_id: String,

    /// Cloud provider of the cluster under test
    #[arg(long, env = PROVIDER_ENV, default_value = DEFAULT_PROVIDER)]
    provider: String,

    /// Kubeconfig path or path list; when omitted the config is inferred from
    /// KUBECONFIG, ~/.kube/config, or the in-cluster environment
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Cloud Monitoring API endpoint
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    monitoring_endpoint: String,

    /// Resource consumer image
    #[arg(long, default_value = RESOURCE_CONSUMER_IMAGE)]
    consumer_image: String,

    /// Seconds between metric checks
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    poll_interval_secs: u64,

    /// Seconds to wait for the metrics before failing
    #[arg(long, default_value_t = DEFAULT_POLL_TIMEOUT.as_secs())]
    poll_timeout_secs: u64,

    /// How utilization series are reduced to one value
    #[arg(long, value_enum, default_value_t = Aggregation::Latest)]
    aggregation: Aggregation,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Aggregation {
    Latest,
    WindowMean,
}

impl From<Aggregation> for UtilizationAggregation {
    fn from(a: Aggregation) -> Self {
        match a {
            Aggregation::Latest => Self::Latest,
            Aggregation::WindowMean => Self::WindowMean,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("Failed to install crypto provider: {:?}", e);
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    if let Err(e) = init_logging(format) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(ScenarioOutcome::Passed) => {
            tracing::info!("PASS: container metrics exported to Cloud Monitoring");
            ExitCode::SUCCESS
        }
        Ok(ScenarioOutcome::Skipped(reason)) => {
            tracing::info!(reason = %reason, "SKIP");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "FAIL");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ScenarioOutcome> {
    let ctx = TestContext {
        project_id: cli.project_id,
        provider: cli.provider,
        kubeconfig: cli.kubeconfig,
    };

    let expected = ExpectedMetrics {
        aggregation: cli.aggregation.into(),
        ..Default::default()
    };
    let poll = PollSettings {
        interval: Duration::from_secs(cli.poll_interval_secs),
        timeout: Duration::from_secs(cli.poll_timeout_secs),
    };
    expected.validate()?;
    poll.validate()?;

    // Skip before touching the cluster or credentials
    if let Some(reason) = skip_unless_provider_is(&ctx, SUPPORTED_PROVIDERS) {
        return Ok(ScenarioOutcome::Skipped(reason));
    }

    let tokens = default_token_source()?;
    let backend = CloudMonitoringClient::new(ctx.project_id.clone(), tokens)?
        .with_endpoint(cli.monitoring_endpoint);

    let client = create_client(ctx.kubeconfig.as_deref()).await?;
    let namespace = TestNamespace::create(client.clone(), SCENARIO_NAME).await?;

    let workloads =
        KubeWorkloads::new(client, namespace.name()).with_image(cli.consumer_image);

    let scenario = ClusterMetricsScenario::new(
        Arc::new(backend),
        Arc::new(workloads),
        Arc::new(SystemClock),
    )
    .with_expected(expected)
    .with_poll(poll);

    let outcome = scenario.run(&ctx).await;

    if let Err(e) = namespace.delete().await {
        tracing::warn!(error = %e, "Failed to delete test namespace");
    }

    Ok(outcome?)
}
