//! Convergence engine for volume-shaped attachments (extra emptyDir volumes
//! and huge-page volumes), parametrized by strategy.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{PodSpec, ResourceRequirements},
    apimachinery::pkg::api::resource::Quantity,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{compare, requests::AttachmentSet, Error, Result};

use super::{ContainerPatch, Context, Converge};

/// How drift between requested and live attachments is converged.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Additions are server-side-applied as a delta containing only the
    /// requested entries; removal replaces the full object with exactly the
    /// requested entries subtracted.
    Merge,

    /// Every mutation is a full replace carrying the complete resulting set.
    /// Entries whose volume name or resource key starts with `prefix` belong
    /// to this engine and are regenerated wholesale from the request set;
    /// everything else in the live object is preserved verbatim.
    ReplaceSuperset { prefix: String },
}

pub struct VolumePatcher {
    ctx: Arc<Context>,
    strategy: Strategy,
}

#[async_trait]
impl Converge for VolumePatcher {
    type Request = AttachmentSet;

    async fn ensure_present(&self, requested: &AttachmentSet) -> Result<()> {
        if requested.is_empty() {
            debug!("No attachments were requested");
            return Ok(());
        }
        if self.is_converged(requested).await? {
            debug!(
                "Workload `{}` already carries the requested attachments",
                self.ctx.workload
            );
            return Ok(());
        }
        match self.strategy.clone() {
            Strategy::Merge => self.apply_delta(requested).await,
            Strategy::ReplaceSuperset { prefix } => {
                self.replace_with_superset(requested, &prefix).await
            }
        }
    }

    async fn is_converged(&self, requested: &AttachmentSet) -> Result<bool> {
        if requested.is_empty() {
            return match &self.strategy {
                // Nothing requested under Merge means nothing to check.
                Strategy::Merge => Ok(true),
                // An empty set under the superset strategy means the owned
                // name family should be gone entirely; leftovers count as
                // drift so status agrees with what `clear()` would do.
                Strategy::ReplaceSuperset { prefix } => {
                    match self.ctx.cluster.get_statefulset(&self.ctx.workload).await {
                        Ok(statefulset) => {
                            let pod_spec = statefulset
                                .spec
                                .as_ref()
                                .and_then(|spec| spec.template.spec.as_ref());
                            Ok(!has_prefixed(
                                pod_spec.unwrap_or(&PodSpec::default()),
                                &self.ctx.container,
                                prefix,
                            )?)
                        }
                        Err(Error::ApiNotReady) => Ok(false),
                        Err(e) => Err(e),
                    }
                }
            };
        }
        let workload = match self.ctx.cluster.get_workload(&self.ctx.workload).await {
            Ok(view) => view,
            Err(Error::ApiNotReady) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !compare::workload_has_volumes(&workload, &requested.volumes) {
            return Ok(false);
        }
        let pod = match self.ctx.cluster.get_pod(&self.ctx.pod).await {
            Ok(view) => view,
            Err(Error::ApiNotReady) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(compare::container_has_mounts(
            pod.containers(),
            &self.ctx.container,
            &requested.mounts,
        )? && compare::container_has_resources(
            pod.containers(),
            &self.ctx.container,
            &requested.limits,
            &requested.requests,
        )?)
    }
}

impl VolumePatcher {
    pub fn new(ctx: Arc<Context>, strategy: Strategy) -> Self {
        Self { ctx, strategy }
    }

    /// Remove the requested entries. Under `Merge` this subtracts exactly the
    /// requested volumes, mounts and resource keys; under `ReplaceSuperset`
    /// the whole owned name family is wiped (the request set only marks the
    /// call as an explicit removal).
    pub async fn ensure_absent(&self, requested: &AttachmentSet) -> Result<()> {
        if requested.is_empty() {
            debug!("No attachments were requested for removal");
            return Ok(());
        }
        match self.strategy.clone() {
            Strategy::ReplaceSuperset { prefix } => self.clear_prefixed(&prefix).await,
            Strategy::Merge => {
                if !self.is_converged(requested).await? {
                    debug!(
                        "Requested attachments are not present on `{}`; nothing to remove",
                        self.ctx.workload
                    );
                    return Ok(());
                }
                self.replace_subtracting(requested).await
            }
        }
    }

    /// Explicit removal path for the superset strategy: wipe every entry of
    /// the owned name family without needing the original request set.
    pub async fn clear(&self) -> Result<()> {
        match self.strategy.clone() {
            Strategy::ReplaceSuperset { prefix } => self.clear_prefixed(&prefix).await,
            Strategy::Merge => {
                debug!("Merge strategy owns no name family; nothing to clear");
                Ok(())
            }
        }
    }

    /// Server-side apply of exactly the requested entries. The apply merges
    /// additively on the server, so the delta never carries unrelated live
    /// state. Selector and service name are required fields of an apply body
    /// and are copied from the live object.
    async fn apply_delta(&self, requested: &AttachmentSet) -> Result<()> {
        let live = self.ctx.cluster.get_statefulset(&self.ctx.workload).await?;
        let live_spec = live.spec.unwrap_or_default();
        let live_containers = live_spec
            .template
            .spec
            .as_ref()
            .map(|pod| pod.containers.as_slice())
            .unwrap_or(&[]);
        compare::find_container(live_containers, &self.ctx.container)?;

        let container = ContainerPatch {
            name: self.ctx.container.clone(),
            volume_mounts: requested.mounts.clone(),
            limits: requested.limits.clone(),
            requests: requested.requests.clone(),
            capabilities: Vec::new(),
        }
        .into_container();

        let patch = json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "spec": {
                "selector": live_spec.selector,
                "serviceName": live_spec.service_name,
                "template": {
                    "spec": {
                        "containers": [container],
                        "volumes": requested.volumes,
                    }
                }
            }
        });
        self.ctx
            .cluster
            .apply_statefulset(&self.ctx.workload, &patch)
            .await?;
        info!(
            "Attachments added to `{}` for container `{}`",
            self.ctx.workload, self.ctx.container
        );
        Ok(())
    }

    /// Full replace carrying the merged superset: freshly generated owned
    /// entries plus every live entry outside the owned name family. State is
    /// re-fetched immediately before computing the replacement to narrow the
    /// lost-update window; there is no optimistic-lock enforcement here.
    async fn replace_with_superset(&self, requested: &AttachmentSet, prefix: &str) -> Result<()> {
        let mut statefulset = self.ctx.cluster.get_statefulset(&self.ctx.workload).await?;
        let pod_spec = statefulset
            .spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default);

        let current_volumes = pod_spec.volumes.take().unwrap_or_default();
        let volumes = replace_prefixed(requested.volumes.clone(), current_volumes, prefix, |v| {
            &v.name
        });
        if volumes.is_empty() {
            warn!("StatefulSet `{}` will have no volumes", self.ctx.workload);
        }
        pod_spec.volumes = Some(volumes);

        let container = container_mut(&mut pod_spec.containers, &self.ctx.container)?;
        let current_mounts = container.volume_mounts.take().unwrap_or_default();
        container.volume_mounts = Some(replace_prefixed(
            requested.mounts.clone(),
            current_mounts,
            prefix,
            |m| &m.name,
        ));
        container.resources = Some(superset_resources(
            container.resources.take(),
            &requested.limits,
            &requested.requests,
            prefix,
        ));

        self.ctx.cluster.replace_statefulset(&statefulset).await
    }

    /// Full replace with the requested entries subtracted by name and the
    /// requested resource keys stripped; keys that are already absent are not
    /// an error.
    async fn replace_subtracting(&self, requested: &AttachmentSet) -> Result<()> {
        let names = requested.volume_names();
        let keys = requested.resource_keys();

        let mut statefulset = self.ctx.cluster.get_statefulset(&self.ctx.workload).await?;
        let pod_spec = statefulset
            .spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default);

        let current_volumes = pod_spec.volumes.take().unwrap_or_default();
        pod_spec.volumes = Some(without_names(current_volumes, &names, |v| &v.name));

        let container = container_mut(&mut pod_spec.containers, &self.ctx.container)?;
        let current_mounts = container.volume_mounts.take().unwrap_or_default();
        container.volume_mounts = Some(without_names(current_mounts, &names, |m| &m.name));
        if let Some(mut resources) = container.resources.take() {
            resources.limits = without_keys(resources.limits, &keys);
            resources.requests = without_keys(resources.requests, &keys);
            container.resources = Some(resources);
        }

        self.ctx.cluster.replace_statefulset(&statefulset).await
    }

    async fn clear_prefixed(&self, prefix: &str) -> Result<()> {
        let mut statefulset = self.ctx.cluster.get_statefulset(&self.ctx.workload).await?;
        let pod_spec = statefulset
            .spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default);

        if !has_prefixed(pod_spec, &self.ctx.container, prefix)? {
            debug!(
                "No `{prefix}` attachments present on `{}`; nothing to clear",
                self.ctx.workload
            );
            return Ok(());
        }

        let current_volumes = pod_spec.volumes.take().unwrap_or_default();
        pod_spec.volumes = Some(replace_prefixed(Vec::new(), current_volumes, prefix, |v| {
            &v.name
        }));

        let container = container_mut(&mut pod_spec.containers, &self.ctx.container)?;
        let current_mounts = container.volume_mounts.take().unwrap_or_default();
        container.volume_mounts = Some(replace_prefixed(Vec::new(), current_mounts, prefix, |m| {
            &m.name
        }));
        container.resources = Some(superset_resources(
            container.resources.take(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            prefix,
        ));

        info!(
            "Cleared `{prefix}` attachments from `{}`",
            self.ctx.workload
        );
        self.ctx.cluster.replace_statefulset(&statefulset).await
    }
}

/// Whether any volume, mount, or resource key of the owned name family
/// remains on the pod template.
fn has_prefixed(pod_spec: &PodSpec, container_name: &str, prefix: &str) -> Result<bool> {
    let tagged_volumes = pod_spec
        .volumes
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .any(|v| v.name.starts_with(prefix));
    let container = compare::find_container(&pod_spec.containers, container_name)?;
    let tagged_mounts = container
        .volume_mounts
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .any(|m| m.name.starts_with(prefix));
    let tagged_keys = container.resources.as_ref().is_some_and(|resources| {
        resources
            .limits
            .iter()
            .chain(resources.requests.iter())
            .flat_map(|map| map.keys())
            .any(|key| key.starts_with(prefix))
    });
    Ok(tagged_volumes || tagged_mounts || tagged_keys)
}

fn container_mut<'a>(
    containers: &'a mut [k8s_openapi::api::core::v1::Container],
    name: &str,
) -> Result<&'a mut k8s_openapi::api::core::v1::Container> {
    containers
        .iter_mut()
        .find(|container| container.name == name)
        .ok_or_else(|| Error::ContainerNotFound(name.to_string()))
}

/// Fresh entries first, then every current entry whose name is outside the
/// owned prefix family.
fn replace_prefixed<T>(
    fresh: Vec<T>,
    current: Vec<T>,
    prefix: &str,
    name: impl Fn(&T) -> &str,
) -> Vec<T> {
    let mut merged = fresh;
    merged.extend(
        current
            .into_iter()
            .filter(|item| !name(item).starts_with(prefix)),
    );
    merged
}

/// Current entries minus those whose name appears in the removal set.
fn without_names<T>(
    current: Vec<T>,
    names: &HashSet<&str>,
    name: impl Fn(&T) -> &str,
) -> Vec<T> {
    current
        .into_iter()
        .filter(|item| !names.contains(name(item)))
        .collect()
}

/// Strip the given keys from a resource map; absent keys are simply skipped.
fn without_keys(
    map: Option<BTreeMap<String, Quantity>>,
    keys: &HashSet<&str>,
) -> Option<BTreeMap<String, Quantity>> {
    map.map(|entries| {
        entries
            .into_iter()
            .filter(|(key, _)| !keys.contains(key.as_str()))
            .collect()
    })
}

/// Current resources with the prefix-tagged keys swapped for the freshly
/// requested ones. Unrelated keys and resource claims are preserved.
fn superset_resources(
    current: Option<ResourceRequirements>,
    limits: &BTreeMap<String, Quantity>,
    requests: &BTreeMap<String, Quantity>,
    prefix: &str,
) -> ResourceRequirements {
    let mut resources = current.unwrap_or_default();

    let mut new_limits = resources.limits.take().unwrap_or_default();
    new_limits.retain(|key, _| !key.starts_with(prefix));
    new_limits.extend(limits.clone());
    resources.limits = Some(new_limits);

    let mut new_requests = resources.requests.take().unwrap_or_default();
    new_requests.retain(|key, _| !key.starts_with(prefix));
    new_requests.extend(requests.clone());
    resources.requests = Some(new_requests);

    resources
}
