use k8s_openapi::{
    api::core::v1::{EmptyDirVolumeSource, Volume, VolumeMount},
    apimachinery::pkg::api::resource::Quantity,
};
use serde::{Deserialize, Serialize};

/// Sizing applied when the caller does not spell out its huge-page requests.
///
/// Threaded into constructors explicitly so tests can vary it without
/// touching globals.
#[derive(Debug, Clone)]
pub struct HugePagesDefaults {
    pub size: String,
    pub limit: String,
}

impl Default for HugePagesDefaults {
    fn default() -> Self {
        Self {
            size: "1Gi".into(),
            limit: "2Gi".into(),
        }
    }
}

/// A huge-page-backed memory volume plus its extended-resource declaration.
///
/// `size` and `limit` are opaque Kubernetes quantity strings and are compared
/// by string equality, never parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HugePagesRequest {
    pub mount_path: String,

    /// Page size, e.g. "1Gi" or "2Mi". Keyed into the `hugepages-<size>`
    /// extended resource name.
    pub size: String,

    /// Quantity requested and limited for the `hugepages-<size>` resource.
    pub limit: String,
}

impl HugePagesRequest {
    pub fn new(mount_path: impl Into<String>, size: impl Into<String>, limit: impl Into<String>) -> Self {
        Self {
            mount_path: mount_path.into(),
            size: size.into(),
            limit: limit.into(),
        }
    }

    pub fn with_defaults(mount_path: impl Into<String>, defaults: &HugePagesDefaults) -> Self {
        Self {
            mount_path: mount_path.into(),
            size: defaults.size.clone(),
            limit: defaults.limit.clone(),
        }
    }

    /// Volume names must be RFC 1123 labels, so the size is lowercased here.
    /// The resource key and emptyDir medium keep the Kubernetes-defined
    /// casing (`hugepages-1Gi`, `HugePages-1Gi`).
    pub fn volume_name(&self) -> String {
        format!("hugepages-{}", self.size.to_lowercase())
    }

    /// Extended-resource name for limits and requests maps.
    pub fn resource_key(&self) -> String {
        format!("hugepages-{}", self.size)
    }

    pub fn volume(&self) -> Volume {
        Volume {
            name: self.volume_name(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some(format!("HugePages-{}", self.size)),
                size_limit: None,
            }),
            ..Default::default()
        }
    }

    pub fn mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.volume_name(),
            mount_path: self.mount_path.clone(),
            ..Default::default()
        }
    }

    pub fn limit_quantity(&self) -> Quantity {
        Quantity(self.limit.clone())
    }
}
