use std::{env, fs, sync::Arc};

use anyhow::Context as _;
use attach_operator::{
    cluster::ClusterClient,
    lifecycle::{LifecycleAdapter, Trigger},
    reconcilers::{Context, MultusPatcher, Strategy, VolumePatcher},
    requests::{HugePagesRequest, NetworkAttachmentRequest, VolumeRequest},
    telemetry,
};
use kube::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

const FIELD_MANAGER: &str = "attach-operator";
const OWNER_LABEL: &str = "attach-operator.io/owned-by";

/// Declarative description of everything to attach to one workload.
#[derive(Debug, Clone, Deserialize)]
struct AttachmentsConfig {
    workload: String,
    container: String,

    /// Pod re-read for convergence checks; defaults to `<workload>-0`.
    #[serde(default)]
    pod: Option<String>,

    #[serde(default)]
    volumes: Vec<VolumeRequest>,
    #[serde(default)]
    hugepages: Vec<HugePagesRequest>,
    #[serde(default)]
    networks: Vec<NetworkAttachmentRequest>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let trigger: Trigger = env::args()
        .nth(1)
        .context("usage: operator <install|upgrade|config-changed|remove>")?
        .parse()
        .map_err(anyhow::Error::msg)?;

    let config_path =
        env::var("ATTACHMENTS_CONFIG").unwrap_or_else(|_| "attachments.yaml".to_string());
    let config: AttachmentsConfig = serde_yaml::from_str(
        &fs::read_to_string(&config_path).with_context(|| format!("reading `{config_path}`"))?,
    )
    .with_context(|| format!("parsing `{config_path}`"))?;

    let client = Client::try_default().await?;
    let namespace = client.default_namespace().to_string();
    let ctx = Arc::new(Context {
        cluster: ClusterClient::new(client, namespace, FIELD_MANAGER),
        pod: config
            .pod
            .clone()
            .unwrap_or_else(|| format!("{}-0", config.workload)),
        workload: config.workload.clone(),
        container: config.container.clone(),
    });

    let volumes = config.volumes.clone();
    let hugepages = config.hugepages.clone();
    let networks = config.networks.clone();
    let adapter = LifecycleAdapter::new()
        .with_volumes(VolumePatcher::new(ctx.clone(), Strategy::Merge), move || {
            volumes.clone()
        })
        .with_hugepages(
            VolumePatcher::new(
                ctx.clone(),
                Strategy::ReplaceSuperset {
                    prefix: "hugepages".to_string(),
                },
            ),
            move || hugepages.clone(),
        )
        .with_multus(MultusPatcher::new(ctx, OWNER_LABEL), move || {
            networks.clone()
        });

    // A shutdown request stops the pass at the next engine boundary.
    let shutdown = CancellationToken::new();
    let signal_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        })
    };

    adapter.handle(trigger, &shutdown).await?;
    signal_task.abort();
    Ok(())
}
