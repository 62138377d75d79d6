//! Convergence engine for Multus secondary networks: per-interface
//! NetworkAttachmentDefinitions plus the pod-template annotation and the
//! NET_ADMIN capability that let the CNI plugin wire the interfaces up.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::{
    compare,
    requests::{annotations_for, encode_annotations, NetworkAnnotation, NetworkAttachmentRequest},
    Error, Result, NETWORKS_ANNOTATION,
};

use super::{ContainerPatch, Context, Converge};

/// Capability the target container needs for the CNI plugin to manage its
/// extra interfaces.
const NET_ADMIN: &str = "NET_ADMIN";

pub struct MultusPatcher {
    ctx: Arc<Context>,
    /// Label key stamped on every definition this engine creates; its value is
    /// the workload name. Definitions without the stamp are never touched.
    owner_label: String,
}

#[async_trait]
impl Converge for MultusPatcher {
    type Request = [NetworkAttachmentRequest];

    async fn ensure_present(&self, requested: &[NetworkAttachmentRequest]) -> Result<()> {
        if requested.is_empty() {
            debug!("No secondary networks were requested");
            return Ok(());
        }

        let mut definitions_changed = false;
        for request in requested {
            definitions_changed |= self.converge_definition(request).await?;
        }
        if definitions_changed {
            // Attachment changes only take effect on a fresh pod; one delete
            // covers every recreated definition in this pass.
            self.ctx.cluster.delete_pod(&self.ctx.pod).await?;
        }

        let annotations = annotations_for(requested);
        if !self.workload_is_patched(&annotations).await? {
            self.patch_workload(&annotations).await?;
        }
        Ok(())
    }

    async fn is_converged(&self, requested: &[NetworkAttachmentRequest]) -> Result<bool> {
        for request in requested {
            let live = match self
                .ctx
                .cluster
                .get_network_attachment_definition(&request.name)
                .await
            {
                Ok(live) => live,
                Err(Error::ApiNotReady) => return Ok(false),
                Err(e) => return Err(e),
            };
            let desired = request.definition(&self.owner_label, &self.ctx.workload);
            match live {
                Some(definition) if definition.spec == desired.spec => {}
                _ => return Ok(false),
            }
        }
        self.workload_is_patched(&annotations_for(requested)).await
    }
}

impl MultusPatcher {
    pub fn new(ctx: Arc<Context>, owner_label: impl Into<String>) -> Self {
        Self {
            ctx,
            owner_label: owner_label.into(),
        }
    }

    /// Whether the secondary networks are fully wired up. Public alias of the
    /// convergence check for status reporting.
    pub async fn is_configured(&self, requested: &[NetworkAttachmentRequest]) -> Result<bool> {
        self.is_converged(requested).await
    }

    /// Delete every definition this engine created for the workload, found by
    /// the owner label rather than by a request set so that removal also
    /// covers definitions from earlier, different request sets.
    pub async fn ensure_absent(&self) -> Result<()> {
        let selector = format!("{}={}", self.owner_label, self.ctx.workload);
        let owned = self
            .ctx
            .cluster
            .list_network_attachment_definitions(&selector)
            .await?;
        if owned.is_empty() {
            debug!("No owned NetworkAttachmentDefinitions to remove");
            return Ok(());
        }
        for definition in owned {
            let name = definition.metadata.name.as_deref().unwrap_or_default();
            self.ctx
                .cluster
                .delete_network_attachment_definition(name)
                .await?;
        }
        Ok(())
    }

    /// Remove the networks annotation from the pod template. A merge patch
    /// with a null value deletes exactly that key; the capability grant is
    /// left in place as it is harmless without the annotation.
    pub async fn unpatch_workload(&self) -> Result<()> {
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { NETWORKS_ANNOTATION: null }
                    }
                }
            }
        });
        self.ctx
            .cluster
            .merge_patch_statefulset(&self.ctx.workload, &patch)
            .await?;
        info!(
            "Networks annotation removed from `{}`",
            self.ctx.workload
        );
        Ok(())
    }

    /// Bring one definition in line with its request. Returns whether a live
    /// definition had to be replaced, which callers use to decide on a pod
    /// restart.
    async fn converge_definition(&self, request: &NetworkAttachmentRequest) -> Result<bool> {
        let desired = request.definition(&self.owner_label, &self.ctx.workload);
        let Some(live) = self
            .ctx
            .cluster
            .get_network_attachment_definition(&request.name)
            .await?
        else {
            self.ctx
                .cluster
                .create_network_attachment_definition(&desired)
                .await?;
            return Ok(false);
        };

        if !self.owns(&live) {
            debug!(
                "NetworkAttachmentDefinition `{}` is managed elsewhere; leaving it alone",
                request.name
            );
            return Ok(false);
        }
        if live.spec == desired.spec {
            return Ok(false);
        }

        info!(
            "NetworkAttachmentDefinition `{}` drifted; recreating",
            request.name
        );
        self.ctx
            .cluster
            .delete_network_attachment_definition(&request.name)
            .await?;
        self.ctx
            .cluster
            .create_network_attachment_definition(&desired)
            .await?;
        Ok(true)
    }

    fn owns(&self, definition: &crate::requests::NetworkAttachmentDefinition) -> bool {
        definition
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.owner_label))
            .is_some_and(|owner| owner == &self.ctx.workload)
    }

    async fn workload_is_patched(&self, annotations: &[NetworkAnnotation]) -> Result<bool> {
        let workload = match self.ctx.cluster.get_workload(&self.ctx.workload).await {
            Ok(view) => view,
            Err(Error::ApiNotReady) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(
            compare::annotation_matches(workload.annotations(), NETWORKS_ANNOTATION, annotations)?
                && compare::container_has_capability(
                    workload.containers(),
                    &self.ctx.container,
                    NET_ADMIN,
                )?,
        )
    }

    /// Server-side apply of the annotation and the capability grant. Selector
    /// and service name are required fields of an apply body and are copied
    /// from the live object.
    async fn patch_workload(&self, annotations: &[NetworkAnnotation]) -> Result<()> {
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
            capabilities: vec![NET_ADMIN.to_string()],
            ..Default::default()
        }
        .into_container();

        let patch = json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "spec": {
                "selector": live_spec.selector,
                "serviceName": live_spec.service_name,
                "template": {
                    "metadata": {
                        "annotations": { NETWORKS_ANNOTATION: encode_annotations(annotations)? }
                    },
                    "spec": { "containers": [container] }
                }
            }
        });
        self.ctx
            .cluster
            .apply_statefulset(&self.ctx.workload, &patch)
            .await?;
        info!(
            "Secondary networks patched onto `{}` for container `{}`",
            self.ctx.workload, self.ctx.container
        );
        Ok(())
    }
}
