//! Minimal e2e test framework
//!
//! Provides the pieces the scenario needs from a cluster test harness: the
//! run context (project, provider, kubeconfig), a provider gate, kube client
//! construction, and a throwaway namespace per test run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use rand::Rng;
use tracing::info;

use crate::{Error, Result};

/// Environment variable naming the Cloud project that receives the metrics
pub const PROJECT_ID_ENV: &str = "E2E_PROJECT_ID";

/// Environment variable naming the cloud provider the cluster runs on
pub const PROVIDER_ENV: &str = "E2E_PROVIDER";

/// Provider assumed when [`PROVIDER_ENV`] is unset
pub const DEFAULT_PROVIDER: &str = "gke";

/// Label put on namespaces created by the framework
pub const FRAMEWORK_LABEL: &str = "e2e-framework";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const NAME_SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const NAME_SUFFIX_LEN: usize = 5;

/// Where and against what the test runs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestContext {
    /// Cloud project whose monitoring data is queried
    pub project_id: String,
    /// Cloud provider of the cluster under test (e.g. `gke`)
    pub provider: String,
    /// Explicit kubeconfig path or path list; when `None` the client config is
    /// inferred (`KUBECONFIG`, `~/.kube/config`, then in-cluster)
    pub kubeconfig: Option<PathBuf>,
}

impl TestContext {
    /// Load the context from [`PROJECT_ID_ENV`] and [`PROVIDER_ENV`]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the context through `lookup`, which maps variable names to values
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let project_id = lookup(PROJECT_ID_ENV)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::config(format!("{} is not set", PROJECT_ID_ENV)))?;
        let provider = lookup(PROVIDER_ENV)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());

        Ok(Self {
            project_id,
            provider,
            kubeconfig: None,
        })
    }
}

/// Reason to skip when the cluster's provider is not one of `providers`
pub fn skip_unless_provider_is(ctx: &TestContext, providers: &[&str]) -> Option<String> {
    if providers.iter().any(|p| p.eq_ignore_ascii_case(&ctx.provider)) {
        return None;
    }

    let provider = if ctx.provider.is_empty() {
        "<unset>"
    } else {
        ctx.provider.as_str()
    };
    Some(format!(
        "only supported for providers {:?} (not {})",
        providers, provider
    ))
}

/// Read a kubeconfig path list (`KUBECONFIG` syntax), merging files in order
///
/// Earlier files win on conflicting entries, as with kubectl.
pub fn read_kubeconfig(paths: &Path) -> Result<Kubeconfig> {
    let mut merged: Option<Kubeconfig> = None;

    for path in std::env::split_paths(paths.as_os_str()) {
        if path.as_os_str().is_empty() {
            continue;
        }
        let next = Kubeconfig::read_from(&path).map_err(|e| {
            Error::config(format!(
                "failed to read kubeconfig {}: {}",
                path.display(),
                e
            ))
        })?;
        merged = Some(match merged {
            Some(current) => current
                .merge(next)
                .map_err(|e| Error::config(format!("failed to merge kubeconfig: {}", e)))?,
            None => next,
        });
    }

    merged.ok_or_else(|| Error::config("empty kubeconfig path"))
}

/// Create a kube client from an optional kubeconfig path or path list
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(paths) => {
            let kubeconfig = read_kubeconfig(paths)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?,
    };

    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config).map_err(Error::from)
}

/// `<base>-<random suffix>`, valid as a namespace name
pub fn generate_name(base: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_SUFFIX_CHARSET[rng.gen_range(0..NAME_SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("{}-{}", base, suffix)
}

/// Namespace owned by one test run
pub struct TestNamespace {
    client: Client,
    name: String,
}

impl TestNamespace {
    /// Create a uniquely named namespace derived from `base_name`
    pub async fn create(client: Client, base_name: &str) -> Result<Self> {
        let name = generate_name(base_name);
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(BTreeMap::from([(
                    FRAMEWORK_LABEL.to_string(),
                    base_name.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        let api: Api<Namespace> = Api::all(client.clone());
        api.create(&PostParams::default(), &namespace).await?;
        info!(namespace = %name, "Created test namespace");

        Ok(Self { client, name })
    }

    /// Namespace name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delete the namespace and everything left in it
    pub async fn delete(self) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(&self.name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(namespace = %self.name, "Deleted test namespace");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
