//! MirrorMesh Operator - storage mirroring peerings across managed clusters

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mirrormesh::controller::{error_policy, reconcile, Context};
use mirrormesh::crd::{ClusterAddOn, MirrorPeer};
use mirrormesh::{MIRROR_PEER_LABEL, SECRET_TYPE_EXCHANGED, SECRET_TYPE_LABEL, SECRET_TYPE_SOURCE};

/// MirrorMesh - Kubernetes operator for cross-cluster storage mirroring peerings
#[derive(Parser, Debug)]
#[command(name = "mirrormesh", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches MirrorPeer CRDs on the hub cluster, provisions token-exchange
    /// addon records for every referenced managed cluster, and exchanges
    /// storage connection credentials between peered clusters once their
    /// addons report Available.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML
        let crd = serde_yaml::to_string(&MirrorPeer::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller().await,
    }
}

/// Ensure the MirrorPeer CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply so
/// the CRD version always matches the operator version. The install is
/// retried because the API server may still be warming up when the operator
/// pod starts. The ClusterAddOn CRD belongs to the multi-cluster substrate
/// and is never installed here.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};
    use mirrormesh::retry::{retry_with_backoff, RetryConfig};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(mirrormesh::FIELD_MANAGER).force();

    tracing::info!("Installing MirrorPeer CRD...");
    retry_with_backoff(
        &RetryConfig::with_max_attempts(5),
        "install_mirrorpeer_crd",
        || async {
            crds.patch(
                "mirrorpeers.mirrormesh.dev",
                &params,
                &Patch::Apply(&MirrorPeer::crd()),
            )
            .await
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install MirrorPeer CRD: {}", e))?;

    tracing::info!("MirrorPeer CRD installed/updated");
    Ok(())
}

/// Run in controller mode - reconciles MirrorPeers on the hub cluster
///
/// Addon record and secret changes are mapped back to the MirrorPeers that
/// own them, so readiness transitions and credential rotations re-trigger
/// reconciliation without any polling.
async fn run_controller() -> anyhow::Result<()> {
    tracing::info!("MirrorMesh controller starting...");

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Operator installs its own CRD on startup
    ensure_crds_installed(&client).await?;

    let ctx = Arc::new(Context::new(client.clone()));

    let peers: Api<MirrorPeer> = Api::all(client.clone());
    let addons: Api<ClusterAddOn> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());

    // Only watch secrets this operator participates in: sources the addon
    // agents report and the exchanged copies it publishes itself.
    let secret_watch = WatcherConfig::default().labels(&format!(
        "{SECRET_TYPE_LABEL} in ({SECRET_TYPE_SOURCE},{SECRET_TYPE_EXCHANGED})"
    ));

    tracing::info!("Starting MirrorPeer controller...");

    Controller::new(peers, WatcherConfig::default())
        .watches(addons, WatcherConfig::default(), addon_to_peers)
        .watches(secrets, secret_watch, secret_to_peers)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((peer, action)) => {
                    tracing::debug!(peer = %peer.name, ?action, "MirrorPeer reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "MirrorPeer reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("MirrorMesh controller shutting down");
    Ok(())
}

/// Map an addon record event to the MirrorPeers referencing it
///
/// The record's back-reference annotation names its owners; every one of them
/// must re-evaluate readiness when the record's reported phase changes.
fn addon_to_peers(addon: ClusterAddOn) -> Vec<ObjectRef<MirrorPeer>> {
    addon
        .peer_refs()
        .into_iter()
        .map(|peer| ObjectRef::new(&peer))
        .collect()
}

/// Map a secret event to the MirrorPeers affected by it
///
/// Exchanged copies carry their owning peer as a label. Source secrets are
/// reported by the addon agent without one; a rotation there concerns every
/// peer referencing the cluster, which the next periodic requeue of those
/// peers picks up via fingerprint comparison.
fn secret_to_peers(secret: Secret) -> Vec<ObjectRef<MirrorPeer>> {
    secret
        .labels()
        .get(MIRROR_PEER_LABEL)
        .map(|peer| vec![ObjectRef::new(peer)])
        .unwrap_or_default()
}
