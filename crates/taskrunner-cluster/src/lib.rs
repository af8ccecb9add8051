//! Cluster access for taskrunner
//!
//! [`ClusterGateway`] is the only way the rest of the system talks to
//! Kubernetes. It reduces Jobs and Pods to the views in `taskrunner_common`
//! and gives every failure the same shape: a `ClusterApi` error carrying the
//! API server's status and body.

#![deny(missing_docs)]

pub mod gateway;

pub use gateway::{job_pod_selector, ClusterGateway, KubeGateway};

#[cfg(any(test, feature = "testing"))]
pub use gateway::MockClusterGateway;
