use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{Container, Pod, Volume},
};
use kube::{
    api::{ListParams, Patch, PatchParams, PostParams},
    Api, Client, ResourceExt as _,
};
use tracing::{debug, info};

use crate::{requests::NetworkAttachmentDefinition, Error, Result};

/// Read-only snapshot of the parts of a StatefulSet's pod template the
/// convergence engines care about. Fetched fresh before every decision and
/// never cached across calls.
#[derive(Debug, Clone)]
pub struct WorkloadView {
    statefulset: StatefulSet,
}

impl WorkloadView {
    pub fn volumes(&self) -> &[Volume] {
        self.statefulset
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod| pod.volumes.as_deref())
            .unwrap_or(&[])
    }

    pub fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.statefulset
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.as_ref())
            .and_then(|metadata| metadata.annotations.as_ref())
    }

    pub fn containers(&self) -> &[Container] {
        self.statefulset
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .map(|pod| pod.containers.as_slice())
            .unwrap_or(&[])
    }
}

impl From<StatefulSet> for WorkloadView {
    fn from(statefulset: StatefulSet) -> Self {
        Self { statefulset }
    }
}

/// Read-only snapshot of a running Pod.
#[derive(Debug, Clone)]
pub struct PodView {
    pod: Pod,
}

impl PodView {
    pub fn containers(&self) -> &[Container] {
        self.pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or(&[])
    }
}

impl From<Pod> for PodView {
    fn from(pod: Pod) -> Self {
        Self { pod }
    }
}

/// Typed facade over the cluster API, fixed to one namespace.
///
/// Apply patches are issued under `field_manager` so repeated applies from
/// this component are recognized as the same owner.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
    namespace: String,
    field_manager: String,
}

impl ClusterClient {
    pub fn new(client: Client, namespace: impl Into<String>, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            field_manager: field_manager.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn statefulsets(&self) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn network_attachment_definitions(&self) -> Api<NetworkAttachmentDefinition> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub async fn get_workload(&self, name: &str) -> Result<WorkloadView> {
        let statefulset = self
            .statefulsets()
            .get(name)
            .await
            .map_err(|e| map_kube_error("get", "StatefulSet", name, e))?;
        Ok(WorkloadView::from(statefulset))
    }

    /// The full live object, for the replace paths which must carry all
    /// unrelated state forward themselves.
    pub async fn get_statefulset(&self, name: &str) -> Result<StatefulSet> {
        self.statefulsets()
            .get(name)
            .await
            .map_err(|e| map_kube_error("get", "StatefulSet", name, e))
    }

    pub async fn get_pod(&self, name: &str) -> Result<PodView> {
        let pod = self
            .pods()
            .get(name)
            .await
            .map_err(|e| map_kube_error("get", "Pod", name, e))?;
        Ok(PodView::from(pod))
    }

    /// Server-side apply of a partial object under this component's field
    /// manager; additively merges into whatever the live object already has.
    pub async fn apply_statefulset(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        let params = PatchParams::apply(&self.field_manager);
        self.statefulsets()
            .patch(name, &params, &Patch::Apply(patch))
            .await
            .map_err(|e| map_kube_error("apply", "StatefulSet", name, e))?;
        info!("Applied patch to StatefulSet `{name}`");
        Ok(())
    }

    /// JSON merge patch; a null value deletes the corresponding key.
    pub async fn merge_patch_statefulset(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        self.statefulsets()
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_kube_error("patch", "StatefulSet", name, e))?;
        info!("Merge-patched StatefulSet `{name}`");
        Ok(())
    }

    /// Full replace. Overwrites concurrent modifications; callers re-fetch
    /// immediately before computing the replacement.
    pub async fn replace_statefulset(&self, statefulset: &StatefulSet) -> Result<()> {
        let name = statefulset.name_any();
        self.statefulsets()
            .replace(&name, &PostParams::default(), statefulset)
            .await
            .map_err(|e| map_kube_error("replace", "StatefulSet", &name, e))?;
        info!("Replaced StatefulSet `{name}`");
        Ok(())
    }

    /// Fetch a definition by name; absence is a regular outcome, not an error.
    pub async fn get_network_attachment_definition(
        &self,
        name: &str,
    ) -> Result<Option<NetworkAttachmentDefinition>> {
        match self.network_attachment_definitions().get(name).await {
            Ok(definition) => Ok(Some(definition)),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
            Err(e) => Err(map_kube_error("get", "NetworkAttachmentDefinition", name, e)),
        }
    }

    pub async fn create_network_attachment_definition(
        &self,
        definition: &NetworkAttachmentDefinition,
    ) -> Result<()> {
        let name = definition.name_any();
        self.network_attachment_definitions()
            .create(&PostParams::default(), definition)
            .await
            .map_err(|e| map_kube_error("create", "NetworkAttachmentDefinition", &name, e))?;
        info!("NetworkAttachmentDefinition `{name}` created");
        Ok(())
    }

    /// Delete a definition, tolerating one that is already gone.
    pub async fn delete_network_attachment_definition(&self, name: &str) -> Result<()> {
        match self
            .network_attachment_definitions()
            .delete(name, &Default::default())
            .await
        {
            Ok(_) => {
                info!("NetworkAttachmentDefinition `{name}` deleted");
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!("NetworkAttachmentDefinition `{name}` already deleted");
                Ok(())
            }
            Err(e) => Err(map_kube_error("delete", "NetworkAttachmentDefinition", name, e)),
        }
    }

    pub async fn list_network_attachment_definitions(
        &self,
        label_selector: &str,
    ) -> Result<Vec<NetworkAttachmentDefinition>> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .network_attachment_definitions()
            .list(&params)
            .await
            .map_err(|e| map_kube_error("list", "NetworkAttachmentDefinition", label_selector, e))?;
        Ok(list.items)
    }

    /// Delete a pod to force rescheduling, tolerating one that is already gone.
    pub async fn delete_pod(&self, name: &str) -> Result<()> {
        match self.pods().delete(name, &Default::default()).await {
            Ok(_) => {
                info!("Pod `{name}` deleted to pick up attachment changes");
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!("Pod `{name}` already gone");
                Ok(())
            }
            Err(e) => Err(map_kube_error("delete", "Pod", name, e)),
        }
    }
}

/// Translate transport-level errors into the domain taxonomy: 401 while the
/// apiserver comes up is soft, a missing read target is typed, everything
/// else is a hard cluster operation failure.
fn map_kube_error(operation: &'static str, kind: &'static str, name: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(response) if response.code == 401 || response.reason == "Unauthorized" => {
            debug!("kube-apiserver not ready yet");
            Error::ApiNotReady
        }
        kube::Error::Api(response) if response.code == 404 => Error::ResourceNotFound {
            kind,
            name: name.to_string(),
        },
        _ => Error::ClusterOperationError {
            operation,
            kind,
            name: name.to_string(),
            source: err,
        },
    }
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;

    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: reason.into(),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn unauthorized_maps_to_not_ready() {
        let mapped = map_kube_error("get", "StatefulSet", "my-app", api_error(401, "Unauthorized"));
        assert!(mapped.is_not_ready());
    }

    #[test]
    fn missing_read_target_maps_to_resource_not_found() {
        let mapped = map_kube_error("get", "Pod", "my-app-0", api_error(404, "NotFound"));
        assert!(matches!(
            mapped,
            Error::ResourceNotFound { kind: "Pod", ref name } if name == "my-app-0"
        ));
    }

    #[test]
    fn rejected_write_maps_to_cluster_operation_error() {
        let mapped = map_kube_error("replace", "StatefulSet", "my-app", api_error(409, "Conflict"));
        assert!(matches!(
            mapped,
            Error::ClusterOperationError { operation: "replace", kind: "StatefulSet", .. }
        ));
    }
}
