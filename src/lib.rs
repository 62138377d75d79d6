use thiserror::Error;

/// Typed facade over the cluster API
pub mod cluster;

/// Convergence predicates over fetched state
pub mod compare;

/// Trigger bindings and desired-state callbacks
pub mod lifecycle;

/// Convergence engines, one per attachment shape
pub mod reconcilers;

/// Desired-state descriptors supplied by the caller
pub mod requests;

/// Log and trace integrations
pub mod telemetry;

/// Annotation read by the Multus CNI plugin to attach secondary interfaces.
pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("cluster {operation} failed for {kind} `{name}`: {source}")]
    ClusterOperationError {
        operation: &'static str,
        kind: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },

    // The apiserver answers 401 while it is still coming up; comparator entry
    // points treat this as "not converged yet" rather than a hard failure.
    #[error("kube-apiserver not ready yet")]
    ApiNotReady,

    #[error("{kind} `{name}` not found")]
    ResourceNotFound { kind: &'static str, name: String },

    #[error("Container `{0}` not found")]
    ContainerNotFound(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether this is the transient apiserver-coming-up condition.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::ApiNotReady)
    }
}
