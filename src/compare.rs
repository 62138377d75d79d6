//! Pure convergence predicates.
//!
//! Every function answers one yes/no question about fetched state and has no
//! side effects. The all-present policy is deliberate: entries the caller did
//! not request never cause a reported mismatch.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{Container, Volume, VolumeMount},
    apimachinery::pkg::api::resource::Quantity,
};

use crate::{
    cluster::WorkloadView,
    requests::NetworkAnnotation,
    Error, Result,
};

/// Whether every requested volume is present in the view, by full structural
/// equality. Extra live volumes are tolerated; an empty live list can only
/// satisfy an empty request set.
pub fn workload_has_volumes(view: &WorkloadView, requested: &[Volume]) -> bool {
    if requested.is_empty() {
        return true;
    }
    let live = view.volumes();
    if live.is_empty() {
        return false;
    }
    requested.iter().all(|volume| live.contains(volume))
}

/// Whether the named container carries every requested mount.
pub fn container_has_mounts(
    containers: &[Container],
    container_name: &str,
    requested: &[VolumeMount],
) -> Result<bool> {
    let container = find_container(containers, container_name)?;
    let live = container.volume_mounts.as_deref().unwrap_or(&[]);
    Ok(requested.iter().all(|mount| live.contains(mount)))
}

/// Whether every requested limit and request key is present with an equal
/// value in the named container. Quantities are opaque strings compared for
/// equality, never parsed. Empty request maps are trivially satisfied.
pub fn container_has_resources(
    containers: &[Container],
    container_name: &str,
    limits: &BTreeMap<String, Quantity>,
    requests: &BTreeMap<String, Quantity>,
) -> Result<bool> {
    let container = find_container(containers, container_name)?;
    let resources = container.resources.as_ref();

    let live_limits = resources.and_then(|r| r.limits.as_ref());
    for (key, value) in limits {
        if live_limits.and_then(|live| live.get(key)) != Some(value) {
            return Ok(false);
        }
    }

    let live_requests = resources.and_then(|r| r.requests.as_ref());
    for (key, value) in requests {
        if live_requests.and_then(|live| live.get(key)) != Some(value) {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Whether the live annotation decodes to exactly the expected entry list.
/// Order-sensitive: the Multus plugin consumes the array as written.
pub fn annotation_matches(
    annotations: Option<&BTreeMap<String, String>>,
    key: &str,
    expected: &[NetworkAnnotation],
) -> Result<bool> {
    let Some(value) = annotations.and_then(|a| a.get(key)) else {
        return Ok(false);
    };
    let live: Vec<NetworkAnnotation> =
        serde_json::from_str(value).map_err(Error::SerializationError)?;
    Ok(live == expected)
}

/// Whether the capability appears in the named container's add list.
pub fn container_has_capability(
    containers: &[Container],
    container_name: &str,
    capability: &str,
) -> Result<bool> {
    let container = find_container(containers, container_name)?;
    Ok(container
        .security_context
        .as_ref()
        .and_then(|sc| sc.capabilities.as_ref())
        .and_then(|caps| caps.add.as_ref())
        .is_some_and(|add| add.iter().any(|c| c == capability)))
}

/// Look up a container by name; absence is a caller configuration bug and
/// gets its own error type, distinct from any cluster condition.
pub fn find_container<'a>(containers: &'a [Container], name: &str) -> Result<&'a Container> {
    containers
        .iter()
        .find(|container| container.name == name)
        .ok_or_else(|| Error::ContainerNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{StatefulSet, StatefulSetSpec},
        core::v1::{
            Capabilities, EmptyDirVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements,
            SecurityContext,
        },
    };

    use super::*;

    fn volume(name: &str, medium: &str) -> Volume {
        Volume {
            name: name.into(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some(medium.into()),
                size_limit: None,
            }),
            ..Default::default()
        }
    }

    fn mount(name: &str, path: &str) -> VolumeMount {
        VolumeMount {
            name: name.into(),
            mount_path: path.into(),
            ..Default::default()
        }
    }

    fn view_with_volumes(volumes: Vec<Volume>) -> WorkloadView {
        WorkloadView::from(StatefulSet {
            spec: Some(StatefulSetSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    #[test]
    fn extra_live_volumes_never_cause_a_mismatch() {
        let view = view_with_volumes(vec![volume("a-volume", "Memory"), volume("b-volume", "Memory")]);
        assert!(workload_has_volumes(&view, &[volume("a-volume", "Memory")]));
    }

    #[test]
    fn missing_requested_volume_is_a_mismatch() {
        let view = view_with_volumes(vec![]);
        assert!(!workload_has_volumes(
            &view,
            &[volume("hugepages-1gi", "HugePages-1Gi")]
        ));
    }

    #[test]
    fn empty_request_set_is_trivially_satisfied() {
        let view = view_with_volumes(vec![]);
        assert!(workload_has_volumes(&view, &[]));
    }

    #[test]
    fn structural_difference_is_a_mismatch() {
        let view = view_with_volumes(vec![volume("a-volume", "Memory")]);
        assert!(!workload_has_volumes(&view, &[volume("a-volume", "HugePages-1Gi")]));
    }

    fn container(name: &str) -> Container {
        Container {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn mounts_follow_the_all_present_policy() {
        let mut target = container("workload");
        target.volume_mounts = Some(vec![
            mount("hugepages-1gi", "/dev/hugepages"),
            mount("a-volume", "/mnt/a"),
        ]);
        let containers = vec![target];

        assert!(container_has_mounts(
            &containers,
            "workload",
            &[mount("a-volume", "/mnt/a")]
        )
        .unwrap());
        assert!(!container_has_mounts(
            &containers,
            "workload",
            &[mount("b-volume", "/mnt/b")]
        )
        .unwrap());
    }

    #[test]
    fn unknown_container_is_a_distinct_fatal_error() {
        let containers = vec![container("workload")];
        let err = container_has_mounts(&containers, "no-such-container", &[]).unwrap_err();
        assert!(matches!(err, Error::ContainerNotFound(name) if name == "no-such-container"));
    }

    #[test]
    fn resources_compare_per_key_and_tolerate_extras() {
        let mut target = container("workload");
        target.resources = Some(ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("a-limit".to_string(), Quantity("a-value".into())),
                ("hugepages-1Gi".to_string(), Quantity("4Gi".into())),
            ])),
            requests: Some(BTreeMap::from([(
                "hugepages-1Gi".to_string(),
                Quantity("4Gi".into()),
            )])),
            ..Default::default()
        });
        let containers = vec![target];

        let wanted = BTreeMap::from([("hugepages-1Gi".to_string(), Quantity("4Gi".into()))]);
        assert!(
            container_has_resources(&containers, "workload", &wanted, &wanted).unwrap()
        );

        let mismatched = BTreeMap::from([("hugepages-1Gi".to_string(), Quantity("8Gi".into()))]);
        assert!(
            !container_has_resources(&containers, "workload", &mismatched, &BTreeMap::new())
                .unwrap()
        );

        // Empty request maps are satisfied even with no live resources at all.
        assert!(container_has_resources(
            &[container("bare")],
            "bare",
            &BTreeMap::new(),
            &BTreeMap::new()
        )
        .unwrap());
    }

    #[test]
    fn annotation_comparison_is_order_sensitive() {
        let first = NetworkAnnotation {
            name: "access-net".into(),
            interface: "access".into(),
            ips: None,
            mac: None,
        };
        let second = NetworkAnnotation {
            name: "core-net".into(),
            interface: "core".into(),
            ips: None,
            mac: None,
        };
        let encoded = serde_json::to_string(&[first.clone(), second.clone()]).unwrap();
        let annotations = BTreeMap::from([("k8s.v1.cni.cncf.io/networks".to_string(), encoded)]);

        assert!(annotation_matches(
            Some(&annotations),
            "k8s.v1.cni.cncf.io/networks",
            &[first.clone(), second.clone()]
        )
        .unwrap());
        assert!(!annotation_matches(
            Some(&annotations),
            "k8s.v1.cni.cncf.io/networks",
            &[second, first]
        )
        .unwrap());
        assert!(!annotation_matches(None, "k8s.v1.cni.cncf.io/networks", &[]).unwrap());
    }

    #[test]
    fn capability_lookup_checks_the_add_list() {
        let mut target = container("workload");
        target.security_context = Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".into()]),
                drop: None,
            }),
            ..Default::default()
        });
        let containers = vec![target, container("sidecar")];

        assert!(container_has_capability(&containers, "workload", "NET_ADMIN").unwrap());
        assert!(!container_has_capability(&containers, "sidecar", "NET_ADMIN").unwrap());
    }
}
