use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{Capabilities, Container, ResourceRequirements, SecurityContext, VolumeMount},
    apimachinery::pkg::api::resource::Quantity,
};

use crate::{cluster::ClusterClient, Result};

pub mod multus;
pub mod volumes;

pub use multus::MultusPatcher;
pub use volumes::{Strategy, VolumePatcher};

/// The context passed around: one reconciliation call operates over exactly
/// one workload and one target container within it.
pub struct Context {
    /// Cluster accessor, fixed to the workload's namespace
    pub cluster: ClusterClient,

    /// StatefulSet whose pod template is being converged
    pub workload: String,

    /// Pod backing the reconciled unit, re-read for mount/resource checks
    pub pod: String,

    /// Target container within the pod template
    pub container: String,
}

/// A convergence engine for one attachment shape.
///
/// Entry points must be idempotent under repeated invocation: a call that
/// observes convergence issues no mutating cluster operation.
#[async_trait]
pub trait Converge {
    type Request: ?Sized + Sync;

    /// Apply the minimal corrective mutation so every requested entry is
    /// present. An empty request set is a silent no-op.
    async fn ensure_present(&self, requested: &Self::Request) -> Result<()>;

    /// Whether live cluster state already satisfies the request set.
    /// An apiserver that is not ready yet reports "not converged".
    async fn is_converged(&self, requested: &Self::Request) -> Result<bool>;
}

/// Delta to apply to one named container inside a pod template.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContainerPatch {
    pub name: String,
    pub volume_mounts: Vec<VolumeMount>,
    pub limits: BTreeMap<String, Quantity>,
    pub requests: BTreeMap<String, Quantity>,
    pub capabilities: Vec<String>,
}

impl ContainerPatch {
    /// Render as a partial container for an apply body; only populated fields
    /// are claimed by the field manager.
    pub fn into_container(self) -> Container {
        let resources = (!self.limits.is_empty() || !self.requests.is_empty()).then(|| {
            ResourceRequirements {
                limits: (!self.limits.is_empty()).then_some(self.limits),
                requests: (!self.requests.is_empty()).then_some(self.requests),
                ..Default::default()
            }
        });
        let security_context = (!self.capabilities.is_empty()).then(|| SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(self.capabilities),
                drop: None,
            }),
            ..Default::default()
        });
        Container {
            name: self.name,
            volume_mounts: (!self.volume_mounts.is_empty()).then_some(self.volume_mounts),
            resources,
            security_context,
            ..Default::default()
        }
    }
}
