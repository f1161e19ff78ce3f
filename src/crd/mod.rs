//! Custom Resource Definitions for the Stratus Kubernetes Operator
//!
//! - StratusCluster: one Stratus installation and its third-party dependencies

mod cluster;

pub use cluster::{
    ClusterCondition, ClusterPhase, ClusterSpec, ClusterStatus, ClusterStorage, ComponentTemplate,
    EnvVar, IngressConfig, ResourceList, ResourceRequirements, StatusPatch, StratusCluster,
    ThirdPartyApp, Topology,
};
