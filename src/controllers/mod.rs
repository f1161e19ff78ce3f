//! Controllers for the Stratus Kubernetes Operator
//!
//! The cluster controller watches `StratusCluster` resources and the child
//! objects they own, and reconciles each cluster through its state machine.

mod cluster;

pub use cluster::{ClusterController, ClusterReconciler, CONTROLLER_NAME};
