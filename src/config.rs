//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;

use crate::error::{OperatorError, Result};
use crate::runtime::ControllerConfig;
use crate::state::MachineSettings;

/// Stratus Kubernetes Operator
#[derive(Parser, Debug, Clone)]
#[command(name = "stratus-operator")]
#[command(version, about = "Kubernetes operator for Stratus clusters")]
pub struct Args {
    /// Path to a kubeconfig file (out-of-cluster mode)
    #[arg(long, conflicts_with = "in_cluster")]
    pub kubeconfig: Option<PathBuf>,

    /// Use the in-cluster service account
    #[arg(long, env = "STRATUS_IN_CLUSTER", default_value = "false")]
    pub in_cluster: bool,

    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "STRATUS_NAMESPACE")]
    pub namespace: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "STRATUS_THREADINESS", default_value = "1")]
    pub threadiness: usize,

    /// Failed syncs of a key before it is dropped from the queue
    #[arg(long, env = "STRATUS_MAX_RETRIES", default_value = "15")]
    pub max_retries: u32,

    /// Seconds between full resyncs of the cluster cache (0 disables)
    #[arg(long, env = "STRATUS_RESYNC_SECONDS", default_value = "300")]
    pub resync_seconds: u64,

    /// Upper bound for a single component deploy, delete or probe
    #[arg(long, env = "STRATUS_OPERATION_TIMEOUT_SECONDS", default_value = "120")]
    pub operation_timeout_seconds: u64,

    /// Failed deploys of one component before the cluster goes to Error
    #[arg(long, env = "STRATUS_CREATE_RETRIES", default_value = "5")]
    pub create_retries: u32,

    /// Seconds between readiness polls while a stage rolls out or tears down
    #[arg(long, env = "STRATUS_POLL_SECONDS", default_value = "5")]
    pub poll_seconds: u64,

    /// Status endpoint bind address
    #[arg(long, env = "STRATUS_STATUS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub status_bind_address: String,
}

/// How to reach the API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubeSource {
    InCluster,
    Kubeconfig(PathBuf),
    /// Environment, then ~/.kube/config, then in-cluster
    Inferred,
}

/// Validated operator configuration.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub kube: KubeSource,
    pub namespace: Option<String>,
    pub controller: ControllerConfig,
    pub machine: MachineSettings,
    pub status_addr: SocketAddr,
}

impl TryFrom<Args> for OperatorConfig {
    type Error = OperatorError;

    fn try_from(args: Args) -> Result<Self> {
        if args.threadiness == 0 {
            return Err(OperatorError::Configuration(
                "--threadiness must be at least 1".to_string(),
            ));
        }
        if args.create_retries == 0 {
            return Err(OperatorError::Configuration(
                "--create-retries must be at least 1".to_string(),
            ));
        }
        let status_addr = args.status_bind_address.parse().map_err(|e| {
            OperatorError::Configuration(format!(
                "invalid --status-bind-address {:?}: {}",
                args.status_bind_address, e
            ))
        })?;

        let kube = match (args.in_cluster, args.kubeconfig) {
            (true, _) => KubeSource::InCluster,
            (false, Some(path)) => KubeSource::Kubeconfig(path),
            (false, None) => KubeSource::Inferred,
        };
        let resync_interval = Duration::from_secs(args.resync_seconds);

        Ok(Self {
            kube,
            namespace: args.namespace.filter(|ns| !ns.is_empty()),
            controller: ControllerConfig {
                threadiness: args.threadiness,
                max_retries: args.max_retries,
                resync_period: (args.resync_seconds > 0).then_some(resync_interval),
            },
            machine: MachineSettings {
                operation_timeout: Duration::from_secs(args.operation_timeout_seconds),
                create_retries: args.create_retries,
                poll_interval: Duration::from_secs(args.poll_seconds.max(1)),
                resync_interval: if args.resync_seconds > 0 {
                    resync_interval
                } else {
                    MachineSettings::default().resync_interval
                },
            },
            status_addr,
        })
    }
}

impl OperatorConfig {
    /// Build a client for the configured API server.
    pub async fn client(&self) -> Result<Client> {
        let config = match &self.kube {
            KubeSource::InCluster => kube::Config::incluster().map_err(|e| {
                OperatorError::Configuration(format!("in-cluster config: {}", e))
            })?,
            KubeSource::Kubeconfig(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    OperatorError::Configuration(format!("reading {}: {}", path.display(), e))
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| OperatorError::Configuration(format!("kubeconfig: {}", e)))?
            }
            KubeSource::Inferred => kube::Config::infer()
                .await
                .map_err(|e| OperatorError::Configuration(format!("inferring config: {}", e)))?,
        };
        Client::try_from(config)
            .map_err(|e| OperatorError::Configuration(format!("building client: {}", e)))
    }
}
