//! Maps workload lifecycle triggers onto the convergence engines.
//!
//! Convergence triggers re-derive the full request sets and converge each
//! bound engine in turn; the removal trigger tears everything down in the
//! reverse order. A cancellation token is consulted between engines so a
//! shutdown request stops the pass at the next boundary instead of being
//! deferred to the end.

use std::str::FromStr;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    reconcilers::{Converge as _, MultusPatcher, VolumePatcher},
    requests::{AttachmentSet, HugePagesRequest, NetworkAttachmentRequest, VolumeRequest},
    Result,
};

/// Lifecycle event the surrounding process reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Install,
    Upgrade,
    ConfigChanged,
    Remove,
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Trigger::Install),
            "upgrade" => Ok(Trigger::Upgrade),
            "config-changed" => Ok(Trigger::ConfigChanged),
            "remove" => Ok(Trigger::Remove),
            other => Err(format!("unknown lifecycle trigger `{other}`")),
        }
    }
}

type Source<T> = Box<dyn Fn() -> Vec<T> + Send + Sync>;

/// Binds convergence engines to lifecycle triggers. Engines are optional so a
/// deployment can run any subset of the three attachment shapes; request sets
/// are re-derived from their sources on every pass, never cached.
#[derive(Default)]
pub struct LifecycleAdapter {
    volumes: Option<(VolumePatcher, Source<VolumeRequest>)>,
    hugepages: Option<(VolumePatcher, Source<HugePagesRequest>)>,
    multus: Option<(MultusPatcher, Source<NetworkAttachmentRequest>)>,
}

impl LifecycleAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_volumes(
        mut self,
        patcher: VolumePatcher,
        source: impl Fn() -> Vec<VolumeRequest> + Send + Sync + 'static,
    ) -> Self {
        self.volumes = Some((patcher, Box::new(source)));
        self
    }

    pub fn with_hugepages(
        mut self,
        patcher: VolumePatcher,
        source: impl Fn() -> Vec<HugePagesRequest> + Send + Sync + 'static,
    ) -> Self {
        self.hugepages = Some((patcher, Box::new(source)));
        self
    }

    pub fn with_multus(
        mut self,
        patcher: MultusPatcher,
        source: impl Fn() -> Vec<NetworkAttachmentRequest> + Send + Sync + 'static,
    ) -> Self {
        self.multus = Some((patcher, Box::new(source)));
        self
    }

    pub async fn handle(&self, trigger: Trigger, shutdown: &CancellationToken) -> Result<()> {
        debug!("Handling lifecycle trigger {trigger:?}");
        match trigger {
            Trigger::Install | Trigger::Upgrade | Trigger::ConfigChanged => {
                self.converge(shutdown).await
            }
            Trigger::Remove => self.teardown(shutdown).await,
        }
    }

    /// Whether every bound engine currently observes convergence.
    pub async fn is_converged(&self) -> Result<bool> {
        if let Some((patcher, source)) = &self.volumes {
            if !patcher.is_converged(&AttachmentSet::from(source().as_slice())).await? {
                return Ok(false);
            }
        }
        if let Some((patcher, source)) = &self.hugepages {
            // Checked even when the derived set is empty: the engine treats
            // leftover owned entries as drift, matching what `clear()` does.
            if !patcher.is_converged(&AttachmentSet::from(source().as_slice())).await? {
                return Ok(false);
            }
        }
        if let Some((patcher, source)) = &self.multus {
            if !patcher.is_configured(&source()).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn converge(&self, shutdown: &CancellationToken) -> Result<()> {
        if let Some((patcher, source)) = &self.volumes {
            if interrupted(shutdown) {
                return Ok(());
            }
            patcher
                .ensure_present(&AttachmentSet::from(source().as_slice()))
                .await?;
        }
        if let Some((patcher, source)) = &self.hugepages {
            if interrupted(shutdown) {
                return Ok(());
            }
            let set = AttachmentSet::from(source().as_slice());
            if set.is_empty() {
                // An emptied request set means huge pages were switched off;
                // stale entries must come out rather than linger.
                patcher.clear().await?;
            } else {
                patcher.ensure_present(&set).await?;
            }
        }
        if let Some((patcher, source)) = &self.multus {
            if interrupted(shutdown) {
                return Ok(());
            }
            patcher.ensure_present(&source()).await?;
        }
        Ok(())
    }

    async fn teardown(&self, shutdown: &CancellationToken) -> Result<()> {
        if let Some((patcher, _)) = &self.multus {
            if interrupted(shutdown) {
                return Ok(());
            }
            patcher.ensure_absent().await?;
            patcher.unpatch_workload().await?;
        }
        if let Some((patcher, _)) = &self.hugepages {
            if interrupted(shutdown) {
                return Ok(());
            }
            patcher.clear().await?;
        }
        if let Some((patcher, source)) = &self.volumes {
            if interrupted(shutdown) {
                return Ok(());
            }
            patcher
                .ensure_absent(&AttachmentSet::from(source().as_slice()))
                .await?;
        }
        Ok(())
    }
}

fn interrupted(shutdown: &CancellationToken) -> bool {
    if shutdown.is_cancelled() {
        info!("Shutdown requested; remaining work is left to the next trigger");
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use http::{Request, Response};
    use hyper::Body;
    use kube::Client;
    use serde_json::json;
    use tower_test::mock::{self, Handle};

    use crate::{
        cluster::ClusterClient,
        reconcilers::{Context, Strategy},
    };

    use super::*;

    type MockHandle = Handle<Request<Body>, Response<Body>>;

    fn test_context() -> (Arc<Context>, MockHandle) {
        let (mock_service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "test-ns");
        let cluster = ClusterClient::new(client, "test-ns", "attach-operator");
        let ctx = Arc::new(Context {
            cluster,
            workload: "my-app".into(),
            pod: "my-app-0".into(),
            container: "workload".into(),
        });
        (ctx, handle)
    }

    #[test]
    fn triggers_parse_from_their_event_names() {
        assert_eq!("install".parse::<Trigger>().unwrap(), Trigger::Install);
        assert_eq!(
            "config-changed".parse::<Trigger>().unwrap(),
            Trigger::ConfigChanged
        );
        assert!("start".parse::<Trigger>().is_err());
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_pass_before_any_cluster_call() {
        let (ctx, _handle) = test_context();
        let adapter = LifecycleAdapter::new().with_volumes(
            VolumePatcher::new(ctx, Strategy::Merge),
            || vec![VolumeRequest::new("a-volume", "/mnt/a", "Memory")],
        );

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        // No responder is running: any cluster call would hang past the timeout.
        tokio::time::timeout(Duration::from_millis(100), async {
            adapter
                .handle(Trigger::ConfigChanged, &shutdown)
                .await
                .unwrap();
            adapter.handle(Trigger::Remove, &shutdown).await.unwrap();
        })
        .await
        .expect("a cancelled token must stop the pass immediately");
    }

    #[tokio::test]
    async fn stale_hugepages_entries_flag_drift_even_with_an_empty_request_set() {
        let (ctx, mut handle) = test_context();
        let adapter = LifecycleAdapter::new().with_hugepages(
            VolumePatcher::new(
                ctx,
                Strategy::ReplaceSuperset {
                    prefix: "hugepages".into(),
                },
            ),
            Vec::new,
        );

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("state was not checked");
            assert_eq!(request.method().as_str(), "GET");
            assert_eq!(
                request.uri().path(),
                "/apis/apps/v1/namespaces/test-ns/statefulsets/my-app"
            );
            send.send_response(
                Response::builder()
                    .body(Body::from(
                        serde_json::to_vec(&json!({
                            "apiVersion": "apps/v1",
                            "kind": "StatefulSet",
                            "metadata": { "name": "my-app", "namespace": "test-ns" },
                            "spec": {
                                "selector": { "matchLabels": { "app": "my-app" } },
                                "serviceName": "my-app",
                                "template": {
                                    "spec": {
                                        "containers": [{
                                            "name": "workload",
                                            "volumeMounts": [{
                                                "name": "hugepages-2mi",
                                                "mountPath": "/dev/hugepages",
                                            }],
                                        }],
                                        "volumes": [{
                                            "name": "hugepages-2mi",
                                            "emptyDir": { "medium": "HugePages-2Mi" },
                                        }],
                                    }
                                }
                            }
                        }))
                        .unwrap(),
                    ))
                    .unwrap(),
            );
        });

        assert!(!adapter.is_converged().await.unwrap());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn removal_unwires_networks_then_annotation() {
        let (ctx, mut handle) = test_context();
        let adapter = LifecycleAdapter::new().with_multus(
            MultusPatcher::new(ctx, "example.com/owned-by"),
            Vec::new,
        );

        let server = tokio::spawn(async move {
            // Owned definition listing comes back empty; only the annotation
            // removal follows.
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method().as_str(), "GET");
            send.send_response(
                Response::builder()
                    .body(Body::from(
                        serde_json::to_vec(&json!({
                            "apiVersion": "k8s.cni.cncf.io/v1",
                            "kind": "NetworkAttachmentDefinitionList",
                            "metadata": {},
                            "items": [],
                        }))
                        .unwrap(),
                    ))
                    .unwrap(),
            );

            let (request, send) = handle.next_request().await.expect("annotation not removed");
            assert_eq!(request.method().as_str(), "PATCH");
            assert_eq!(
                request.uri().path(),
                "/apis/apps/v1/namespaces/test-ns/statefulsets/my-app"
            );
            send.send_response(
                Response::builder()
                    .body(Body::from(
                        serde_json::to_vec(&json!({
                            "apiVersion": "apps/v1",
                            "kind": "StatefulSet",
                            "metadata": { "name": "my-app", "namespace": "test-ns" },
                        }))
                        .unwrap(),
                    ))
                    .unwrap(),
            );
        });

        let shutdown = CancellationToken::new();
        adapter.handle(Trigger::Remove, &shutdown).await.unwrap();
        server.await.unwrap();
    }
}
