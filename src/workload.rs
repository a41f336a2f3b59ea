//! Synthetic resource-consumer workload
//!
//! The metrics check needs a container with a known, steady CPU and memory
//! load. The resource-consumer image burns whatever it is told to over HTTP,
//! so the workload is:
//!
//! - a Deployment, ReplicaSet, or ReplicationController running the image with
//!   the configured requests and limits,
//! - a Service in front of the pods, and
//! - a background driver that keeps asking the pods (through the API server's
//!   service proxy) to consume the target CPU and memory.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, ReplicationController,
    ReplicationControllerSpec, ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::poll::poll_until;
use crate::{Error, Result};

/// Image serving the ConsumeCPU / ConsumeMem endpoints
pub const RESOURCE_CONSUMER_IMAGE: &str = "registry.k8s.io/e2e-test-images/resource-consumer:1.13";

/// Port the resource consumer listens on
pub const RESOURCE_CONSUMER_PORT: i32 = 8080;

/// How often consumption requests are re-sent
pub const CONSUMPTION_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between ready-replica checks
pub const REPLICA_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// Budget for replicas to become ready
pub const REPLICA_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Workload controller used for the consumer pods
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 ReplicaSet
    ReplicaSet,
    /// core/v1 ReplicationController
    ReplicationController,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment => write!(f, "Deployment"),
            Self::ReplicaSet => write!(f, "ReplicaSet"),
            Self::ReplicationController => write!(f, "ReplicationController"),
        }
    }
}

/// Shape and load of the synthetic workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceConsumerSpec {
    /// Name of the workload, its Service, and its container
    pub name: String,
    /// Controller kind
    pub kind: WorkloadKind,
    /// Replica count
    pub replicas: i32,
    /// Total CPU to consume, in millicores
    pub cpu_millicores: i64,
    /// Total memory to consume, in megabytes
    pub memory_megabytes: i64,
    /// Per-container CPU limit, in millicores
    pub cpu_limit_millicores: i64,
    /// Per-container memory limit, in megabytes
    pub memory_limit_megabytes: i64,
}

/// A created workload
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadHandle: Send + Sync {
    /// Block until exactly `replicas` pods are ready
    async fn wait_for_replicas(&self, replicas: i32) -> Result<()>;

    /// Stop generating load and delete everything that was created
    async fn clean_up(&self) -> Result<()>;
}

/// Creates synthetic workloads
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadLifecycle: Send + Sync {
    /// Create the workload and start its load
    async fn create(&self, spec: &ResourceConsumerSpec) -> Result<Box<dyn WorkloadHandle>>;
}

// =============================================================================
// Object builders
// =============================================================================

fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("name".to_string(), name.to_string())])
}

fn metadata(spec: &ResourceConsumerSpec, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(spec.name.clone()),
        namespace: Some(namespace.to_string()),
        labels: Some(selector_labels(&spec.name)),
        ..Default::default()
    }
}

/// Pod template running the resource consumer
pub fn pod_template(spec: &ResourceConsumerSpec, image: &str) -> PodTemplateSpec {
    let requests = BTreeMap::from([
        (
            "cpu".to_string(),
            Quantity(format!("{}m", spec.cpu_millicores / i64::from(spec.replicas.max(1)))),
        ),
        (
            "memory".to_string(),
            Quantity(format!("{}Mi", spec.memory_megabytes / i64::from(spec.replicas.max(1)))),
        ),
    ]);
    let limits = BTreeMap::from([
        (
            "cpu".to_string(),
            Quantity(format!("{}m", spec.cpu_limit_millicores)),
        ),
        (
            "memory".to_string(),
            Quantity(format!("{}Mi", spec.memory_limit_megabytes)),
        ),
    ]);

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(selector_labels(&spec.name)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: spec.name.clone(),
                image: Some(image.to_string()),
                ports: Some(vec![ContainerPort {
                    container_port: RESOURCE_CONSUMER_PORT,
                    ..Default::default()
                }]),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    limits: Some(limits),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

/// Deployment variant of the workload
pub fn build_deployment(spec: &ResourceConsumerSpec, namespace: &str, image: &str) -> Deployment {
    Deployment {
        metadata: metadata(spec, namespace),
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&spec.name)),
                ..Default::default()
            },
            template: pod_template(spec, image),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ReplicaSet variant of the workload
pub fn build_replica_set(spec: &ResourceConsumerSpec, namespace: &str, image: &str) -> ReplicaSet {
    ReplicaSet {
        metadata: metadata(spec, namespace),
        spec: Some(ReplicaSetSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&spec.name)),
                ..Default::default()
            },
            template: Some(pod_template(spec, image)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ReplicationController variant of the workload
pub fn build_replication_controller(
    spec: &ResourceConsumerSpec,
    namespace: &str,
    image: &str,
) -> ReplicationController {
    ReplicationController {
        metadata: metadata(spec, namespace),
        spec: Some(ReplicationControllerSpec {
            replicas: Some(spec.replicas),
            selector: Some(selector_labels(&spec.name)),
            template: Some(pod_template(spec, image)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service fronting the consumer pods
pub fn build_service(spec: &ResourceConsumerSpec, namespace: &str) -> Service {
    Service {
        metadata: metadata(spec, namespace),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&spec.name)),
            ports: Some(vec![ServicePort {
                port: RESOURCE_CONSUMER_PORT,
                target_port: Some(IntOrString::Int(RESOURCE_CONSUMER_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Split `total` into `parts` near-equal shares, remainder going to the first
pub fn split_evenly(total: i64, parts: i32) -> Vec<i64> {
    let parts = i64::from(parts.max(1));
    let share = total / parts;
    let remainder = total % parts;
    (0..parts)
        .map(|i| if i < remainder { share + 1 } else { share })
        .collect()
}

/// Service-proxy path for one consumption request
pub fn consume_path(
    namespace: &str,
    service: &str,
    endpoint: &str,
    amount_param: &str,
    amount: i64,
    duration: Duration,
) -> String {
    format!(
        "/api/v1/namespaces/{}/services/{}/proxy/{}?{}={}&durationSec={}",
        namespace,
        service,
        endpoint,
        amount_param,
        amount,
        duration.as_secs()
    )
}

// =============================================================================
// Kubernetes implementation
// =============================================================================

/// Creates resource consumers in one namespace
#[derive(Clone)]
pub struct KubeWorkloads {
    client: Client,
    namespace: String,
    image: String,
    consumption_interval: Duration,
}

impl KubeWorkloads {
    /// Workloads in `namespace` using the default image
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            image: RESOURCE_CONSUMER_IMAGE.to_string(),
            consumption_interval: CONSUMPTION_INTERVAL,
        }
    }

    /// Override the consumer image (mirrors, air-gapped registries)
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }
}

#[async_trait]
impl WorkloadLifecycle for KubeWorkloads {
    async fn create(&self, spec: &ResourceConsumerSpec) -> Result<Box<dyn WorkloadHandle>> {
        let pp = PostParams::default();
        let ns = &self.namespace;

        info!(
            name = %spec.name,
            kind = %spec.kind,
            replicas = spec.replicas,
            namespace = %ns,
            "Creating resource consumer"
        );

        match spec.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
                api.create(&pp, &build_deployment(spec, ns, &self.image))
                    .await?;
            }
            WorkloadKind::ReplicaSet => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), ns);
                api.create(&pp, &build_replica_set(spec, ns, &self.image))
                    .await?;
            }
            WorkloadKind::ReplicationController => {
                let api: Api<ReplicationController> = Api::namespaced(self.client.clone(), ns);
                api.create(&pp, &build_replication_controller(spec, ns, &self.image))
                    .await?;
            }
        }

        let services: Api<Service> = Api::namespaced(self.client.clone(), ns);
        services.create(&pp, &build_service(spec, ns)).await?;

        let consumer = ResourceConsumer {
            client: self.client.clone(),
            namespace: ns.clone(),
            spec: spec.clone(),
            cancel: CancellationToken::new(),
            driver: Mutex::new(None),
        };
        consumer.start_load(self.consumption_interval).await;

        Ok(Box::new(consumer))
    }
}

/// Handle to a running resource consumer
pub struct ResourceConsumer {
    client: Client,
    namespace: String,
    spec: ResourceConsumerSpec,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceConsumer {
    async fn start_load(&self, interval: Duration) {
        let driver = LoadDriver {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            spec: self.spec.clone(),
            interval,
        };
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move { driver.run(cancel).await });
        *self.driver.lock().await = Some(handle);
    }

    async fn ready_replicas(&self) -> Result<Option<i32>> {
        let ns = &self.namespace;
        let name = &self.spec.name;

        let ready = match self.spec.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
                api.get_opt(name)
                    .await?
                    .map(|d| d.status.and_then(|s| s.ready_replicas).unwrap_or(0))
            }
            WorkloadKind::ReplicaSet => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), ns);
                api.get_opt(name)
                    .await?
                    .map(|r| r.status.and_then(|s| s.ready_replicas).unwrap_or(0))
            }
            WorkloadKind::ReplicationController => {
                let api: Api<ReplicationController> = Api::namespaced(self.client.clone(), ns);
                api.get_opt(name)
                    .await?
                    .map(|r| r.status.and_then(|s| s.ready_replicas).unwrap_or(0))
            }
        };

        Ok(ready)
    }

    async fn delete_workload(&self) -> Result<()> {
        let ns = &self.namespace;
        let name = &self.spec.name;
        let dp = DeleteParams::background();

        match self.spec.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
                ignore_not_found(api.delete(name, &dp).await.map(|_| ()))?;
            }
            WorkloadKind::ReplicaSet => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), ns);
                ignore_not_found(api.delete(name, &dp).await.map(|_| ()))?;
            }
            WorkloadKind::ReplicationController => {
                let api: Api<ReplicationController> = Api::namespaced(self.client.clone(), ns);
                ignore_not_found(api.delete(name, &dp).await.map(|_| ()))?;
            }
        }

        let services: Api<Service> = Api::namespaced(self.client.clone(), ns);
        ignore_not_found(services.delete(name, &dp).await.map(|_| ()))?;
        Ok(())
    }
}

fn ignore_not_found(result: std::result::Result<(), kube::Error>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl WorkloadHandle for ResourceConsumer {
    async fn wait_for_replicas(&self, replicas: i32) -> Result<()> {
        let this = self;
        let name = self.spec.name.clone();
        let description = format!(
            "{} {} to have {} ready replicas",
            self.spec.kind, name, replicas
        );

        poll_until(REPLICA_POLL_INTERVAL, REPLICA_TIMEOUT, description, move || {
            let name = name.clone();
            async move {
                match this.ready_replicas().await? {
                    Some(ready) => {
                        debug!(name = %name, ready, want = replicas, "Checked ready replicas");
                        Ok(ready == replicas)
                    }
                    None => Err(Error::workload(format!(
                        "{} {} disappeared while waiting for replicas",
                        this.spec.kind, name
                    ))),
                }
            }
        })
        .await
    }

    async fn clean_up(&self) -> Result<()> {
        info!(
            name = %self.spec.name,
            namespace = %self.namespace,
            "Cleaning up resource consumer"
        );
        self.cancel.cancel();

        if let Some(handle) = self.driver.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Load driver task ended abnormally");
            }
        }

        self.delete_workload().await
    }
}

/// Periodically asks the consumer pods to burn CPU and memory
struct LoadDriver {
    client: Client,
    namespace: String,
    spec: ResourceConsumerSpec,
    interval: Duration,
}

impl LoadDriver {
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(name = %self.spec.name, "Load driver stopped");
                    return;
                }
                _ = ticker.tick() => self.send_consumption().await,
            }
        }
    }

    async fn send_consumption(&self) {
        let cpu = split_evenly(self.spec.cpu_millicores, self.spec.replicas);
        let memory = split_evenly(self.spec.memory_megabytes, self.spec.replicas);

        for (millicores, megabytes) in cpu.into_iter().zip(memory) {
            if millicores > 0 {
                self.post("ConsumeCPU", "millicores", millicores).await;
            }
            if megabytes > 0 {
                self.post("ConsumeMem", "megabytes", megabytes).await;
            }
        }
    }

    async fn post(&self, endpoint: &str, amount_param: &str, amount: i64) {
        let path = consume_path(
            &self.namespace,
            &self.spec.name,
            endpoint,
            amount_param,
            amount,
            self.interval,
        );

        let request = match http::Request::post(path.as_str()).body(Vec::new()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, path = %path, "Failed to build consumption request");
                return;
            }
        };

        match self.client.request_text(request).await {
            Ok(_) => debug!(endpoint, amount, "Sent consumption request"),
            // retried on the next tick
            Err(e) => warn!(error = %e, endpoint, amount, "Consumption request failed"),
        }
    }
}
