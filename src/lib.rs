//! Stratus Kubernetes Operator
//!
//! Drives `StratusCluster` resources through their lifecycle: validation,
//! staged deployment of third-party applications and core components,
//! drift-triggered updates, pause/restart, and ordered teardown on deletion.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: stratus.io/v1alpha1
//! kind: StratusCluster
//! metadata:
//!   name: my-cluster
//! spec:
//!   topology: MultiNode
//!   thirdParties:
//!     - name: cert-manager
//!   storage:
//!     size: 20Gi
//! ```

pub mod components;
pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod hash;
pub mod runtime;
pub mod server;
pub mod state;

pub use config::{Args, OperatorConfig};
pub use controllers::ClusterController;
pub use crd::{
    ClusterCondition, ClusterPhase, ClusterSpec, ClusterStatus, ClusterStorage, StratusCluster,
    Topology,
};
pub use error::{OperatorError, Result};
