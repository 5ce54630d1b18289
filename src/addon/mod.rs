//! Addon provisioning for MirrorPeer-referenced clusters
//!
//! Each cluster referenced by a MirrorPeer needs exactly one token-exchange
//! addon record in its hub namespace. Records are shared: a cluster referenced
//! by several MirrorPeers has a single record whose owning peers are tracked
//! as a back-reference set in an annotation. The provisioner performs a
//! three-way diff on every reconcile: create records for newly referenced
//! clusters, update drifted install namespaces, and release records for
//! clusters the spec no longer names.
//!
//! All mutations to shared records go through conditional updates keyed on the
//! record's resourceVersion; a lost race surfaces as [`Error::Conflict`] and
//! the MirrorPeer is requeued.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{ClusterAddOn, ClusterAddOnSpec, MirrorPeer};
use crate::{Error, PEERS_ANNOTATION, TOKEN_EXCHANGE_ADDON};

/// Trait abstracting addon record operations on the hub API server
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AddonStore: Send + Sync {
    /// Get the token-exchange addon record in the given cluster namespace
    async fn get(&self, cluster_namespace: &str) -> Result<Option<ClusterAddOn>, Error>;

    /// List all addon records whose back-reference set contains the peer
    async fn list_referenced_by(&self, peer_name: &str) -> Result<Vec<ClusterAddOn>, Error>;

    /// Create a new addon record
    async fn create(&self, addon: &ClusterAddOn) -> Result<(), Error>;

    /// Conditionally update an addon record
    ///
    /// The update is keyed on the record's last-observed resourceVersion;
    /// losing the race to another reconciliation yields [`Error::Conflict`].
    async fn update(&self, addon: &ClusterAddOn) -> Result<(), Error>;

    /// Delete the addon record in the given cluster namespace
    ///
    /// Absence of the record is success, not failure.
    async fn delete(&self, cluster_namespace: &str) -> Result<(), Error>;
}

/// Real addon store backed by the hub cluster's API server
pub struct AddonStoreImpl {
    client: Client,
}

impl AddonStoreImpl {
    /// Create a new AddonStoreImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ClusterAddOn> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl AddonStore for AddonStoreImpl {
    async fn get(&self, cluster_namespace: &str) -> Result<Option<ClusterAddOn>, Error> {
        match self.api(cluster_namespace).get(TOKEN_EXCHANGE_ADDON).await {
            Ok(addon) => Ok(Some(addon)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_referenced_by(&self, peer_name: &str) -> Result<Vec<ClusterAddOn>, Error> {
        let api: Api<ClusterAddOn> = Api::all(self.client.clone());
        let addons = api.list(&ListParams::default()).await?;
        Ok(addons
            .items
            .into_iter()
            .filter(|a| a.name_any() == TOKEN_EXCHANGE_ADDON && a.is_referenced_by(peer_name))
            .collect())
    }

    async fn create(&self, addon: &ClusterAddOn) -> Result<(), Error> {
        let namespace = addon.namespace().unwrap_or_default();
        self.api(&namespace)
            .create(&PostParams::default(), addon)
            .await?;
        Ok(())
    }

    async fn update(&self, addon: &ClusterAddOn) -> Result<(), Error> {
        let namespace = addon.namespace().unwrap_or_default();
        let name = addon.name_any();
        match self
            .api(&namespace)
            .replace(&name, &PostParams::default(), addon)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::conflict(format!(
                "addon record {}/{} changed since read",
                namespace, name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, cluster_namespace: &str) -> Result<(), Error> {
        match self
            .api(cluster_namespace)
            .delete(TOKEN_EXCHANGE_ADDON, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Compute the desired addon set for a MirrorPeer
///
/// Maps each referenced cluster to the namespace the addon agent should be
/// installed into on the member cluster.
fn desired_addons(peer: &MirrorPeer) -> BTreeMap<String, String> {
    peer.spec
        .items
        .iter()
        .map(|item| {
            (
                item.cluster_name.clone(),
                item.storage_cluster_ref.namespace.clone(),
            )
        })
        .collect()
}

/// Build a fresh addon record for a cluster first referenced by this peer
fn new_addon(cluster: &str, install_namespace: &str, peer_name: &str) -> ClusterAddOn {
    let mut annotations = BTreeMap::new();
    annotations.insert(PEERS_ANNOTATION.to_string(), peer_name.to_string());
    ClusterAddOn {
        metadata: ObjectMeta {
            name: Some(TOKEN_EXCHANGE_ADDON.to_string()),
            namespace: Some(cluster.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: ClusterAddOnSpec {
            install_namespace: install_namespace.to_string(),
        },
        status: None,
    }
}

/// Reconcile the addon records for a MirrorPeer
///
/// Validates the spec first; an invalid spec fails fast with no side effects.
/// Then creates missing records, joins or updates existing ones, and releases
/// records for clusters the spec no longer references.
pub async fn provision(peer: &MirrorPeer, store: &dyn AddonStore) -> Result<(), Error> {
    peer.spec.validate()?;

    let peer_name = peer.name_any();
    let desired = desired_addons(peer);

    // Converge each desired cluster
    for (cluster, install_namespace) in &desired {
        match store.get(cluster).await? {
            None => {
                info!(cluster = %cluster, peer = %peer_name, "creating addon record");
                store
                    .create(&new_addon(cluster, install_namespace, &peer_name))
                    .await?;
            }
            Some(mut addon) => {
                let mut refs = addon.peer_refs();
                let mut changed = false;

                if !refs.iter().any(|p| p == &peer_name) {
                    refs.push(peer_name.clone());
                    addon.set_peer_refs(refs);
                    changed = true;
                }
                if &addon.spec.install_namespace != install_namespace {
                    addon.spec.install_namespace = install_namespace.clone();
                    changed = true;
                }

                if changed {
                    debug!(cluster = %cluster, peer = %peer_name, "updating addon record");
                    store.update(&addon).await?;
                }
            }
        }
    }

    // Release records for clusters no longer in the spec
    for addon in store.list_referenced_by(&peer_name).await? {
        let cluster = addon.namespace().unwrap_or_default();
        if !desired.contains_key(&cluster) {
            release(addon, &peer_name, store).await?;
        }
    }

    Ok(())
}

/// Release one addon record from a MirrorPeer
///
/// Removes the peer from the record's back-reference set; the record is
/// physically deleted only when no peer references it any more.
pub async fn release(
    mut addon: ClusterAddOn,
    peer_name: &str,
    store: &dyn AddonStore,
) -> Result<(), Error> {
    let cluster = addon.namespace().unwrap_or_default();
    let refs: Vec<String> = addon
        .peer_refs()
        .into_iter()
        .filter(|p| p != peer_name)
        .collect();

    if refs.is_empty() {
        info!(cluster = %cluster, peer = %peer_name, "deleting unreferenced addon record");
        store.delete(&cluster).await
    } else {
        info!(
            cluster = %cluster,
            peer = %peer_name,
            remaining = refs.len(),
            "removing peer from shared addon record"
        );
        addon.set_peer_refs(refs);
        store.update(&addon).await
    }
}
