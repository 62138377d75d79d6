use std::collections::{BTreeMap, HashSet};

use k8s_openapi::{
    api::core::v1::{Volume, VolumeMount},
    apimachinery::pkg::api::resource::Quantity,
};

mod hugepages;
mod network;
mod volume;

pub use hugepages::{HugePagesDefaults, HugePagesRequest};
pub use network::{
    annotations_for, encode_annotations, NetworkAnnotation, NetworkAttachmentDefinition,
    NetworkAttachmentDefinitionSpec, NetworkAttachmentRequest,
};
pub use volume::VolumeRequest;

/// Derived bundle of volumes, mounts and resource entries fed to the volume
/// convergence engine. Built fresh from a request set on every call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentSet {
    pub volumes: Vec<Volume>,
    pub mounts: Vec<VolumeMount>,
    pub limits: BTreeMap<String, Quantity>,
    pub requests: BTreeMap<String, Quantity>,
}

impl AttachmentSet {
    /// An empty set is always a silent no-op for the engines.
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
            && self.mounts.is_empty()
            && self.limits.is_empty()
            && self.requests.is_empty()
    }

    /// Volume names in this set; mounts share the same names by construction.
    pub(crate) fn volume_names(&self) -> HashSet<&str> {
        self.volumes.iter().map(|v| v.name.as_str()).collect()
    }

    /// Resource keys carried in either limits or requests.
    pub(crate) fn resource_keys(&self) -> HashSet<&str> {
        self.limits
            .keys()
            .chain(self.requests.keys())
            .map(String::as_str)
            .collect()
    }
}

impl From<&[VolumeRequest]> for AttachmentSet {
    fn from(requested: &[VolumeRequest]) -> Self {
        Self {
            volumes: requested.iter().map(VolumeRequest::volume).collect(),
            mounts: requested.iter().map(VolumeRequest::mount).collect(),
            limits: BTreeMap::new(),
            requests: BTreeMap::new(),
        }
    }
}

impl From<&[HugePagesRequest]> for AttachmentSet {
    fn from(requested: &[HugePagesRequest]) -> Self {
        let mut limits = BTreeMap::new();
        let mut requests = BTreeMap::new();
        for hugepages in requested {
            limits.insert(hugepages.resource_key(), hugepages.limit_quantity());
            requests.insert(hugepages.resource_key(), hugepages.limit_quantity());
        }
        Self {
            volumes: requested.iter().map(HugePagesRequest::volume).collect(),
            mounts: requested.iter().map(HugePagesRequest::mount).collect(),
            limits,
            requests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_request_slices_build_empty_sets() {
        assert!(AttachmentSet::from(&[] as &[VolumeRequest]).is_empty());
        assert!(AttachmentSet::from(&[] as &[HugePagesRequest]).is_empty());
    }

    #[test]
    fn hugepages_set_carries_matching_resource_entries() {
        let set = AttachmentSet::from(
            &[HugePagesRequest::new("/dev/hugepages", "1Gi", "4Gi")] as &[_],
        );

        assert_eq!(set.volumes[0].name, "hugepages-1gi");
        assert_eq!(set.mounts[0].mount_path, "/dev/hugepages");
        assert_eq!(set.limits["hugepages-1Gi"], Quantity("4Gi".into()));
        assert_eq!(set.requests["hugepages-1Gi"], Quantity("4Gi".into()));
    }
}
