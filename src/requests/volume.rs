use k8s_openapi::{
    api::core::v1::{EmptyDirVolumeSource, Volume, VolumeMount},
    apimachinery::pkg::api::resource::Quantity,
};
use serde::{Deserialize, Serialize};

/// One extra volume to declare on the workload and mount into the target
/// container.
///
/// `name` is the join key between the volume and its mount and must be unique
/// within a single request set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub name: String,

    /// Where the volume is mounted inside the container.
    pub mount_path: String,

    /// emptyDir backing medium, e.g. "Memory" or "HugePages-1Gi".
    pub medium: String,

    /// Optional emptyDir size limit, carried as an opaque quantity string.
    #[serde(default)]
    pub size_limit: Option<String>,
}

impl VolumeRequest {
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>, medium: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
            medium: medium.into(),
            size_limit: None,
        }
    }

    /// The volume to declare in the workload's pod template.
    pub fn volume(&self) -> Volume {
        Volume {
            name: self.name.clone(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some(self.medium.clone()),
                size_limit: self.size_limit.clone().map(Quantity),
            }),
            ..Default::default()
        }
    }

    /// The matching mount for the target container.
    pub fn mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.name.clone(),
            mount_path: self.mount_path.clone(),
            ..Default::default()
        }
    }
}
