//! Token exchange between peered clusters
//!
//! Once every addon of a MirrorPeer reports Available, each cluster's storage
//! connection secret is published into every peer cluster's hub namespace.
//! The addon agent reports the source secret under a well-known name in the
//! source cluster's hub namespace; the coordinator copies it to the
//! destination side under a name that encodes its origin.
//!
//! Exchanges are idempotent by SHA-256 fingerprint: a destination copy whose
//! fingerprint matches the source payload is left untouched, and a changed
//! fingerprint (credential rotation) triggers a republish. Pairs are
//! independent: one pair's failure never blocks the others, and a pair that
//! exhausts its attempt budget is marked Failed until the credential rotates.

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{ExchangeState, MirrorPeer, PairExchangeStatus, PeerRef, SecretExchangeMode};
use crate::readiness::PeerReadiness;
use crate::{
    Error, FIELD_MANAGER, FINGERPRINT_ANNOTATION, MIRROR_PEER_LABEL, SECRET_TYPE_EXCHANGED,
    SECRET_TYPE_LABEL,
};

/// Annotation recording which cluster an exchanged secret originated from
const SOURCE_CLUSTER_ANNOTATION: &str = "mirrormesh.dev/source-cluster";

/// Attempts per pair before the exchange is surfaced as Failed
///
/// The budget bounds API churn on a persistently broken pair; a credential
/// rotation or operator restart resets it.
pub const MAX_EXCHANGE_ATTEMPTS: u32 = 5;

/// Trait abstracting secret operations on the hub API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Get a secret, None if absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create or update a secret via server-side apply
    async fn apply(&self, secret: &Secret) -> Result<(), Error>;

    /// Delete a secret; absence is success
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// List all exchanged secrets published for the given peer
    async fn list_exchanged(&self, peer_name: &str) -> Result<Vec<Secret>, Error>;
}

/// Real secret store backed by the hub cluster's API server
pub struct SecretStoreImpl {
    client: Client,
}

impl SecretStoreImpl {
    /// Create a new SecretStoreImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for SecretStoreImpl {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        match self.api(namespace).get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        self.api(&namespace)
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(secret),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_exchanged(&self, peer_name: &str) -> Result<Vec<Secret>, Error> {
        let api: Api<Secret> = Api::all(self.client.clone());
        let selector = format!(
            "{}={},{}={}",
            MIRROR_PEER_LABEL, peer_name, SECRET_TYPE_LABEL, SECRET_TYPE_EXCHANGED
        );
        let secrets = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(secrets.items)
    }
}

/// Well-known name the addon agent reports a source secret under
pub fn source_secret_name(storage_cluster_name: &str) -> String {
    format!("token-exchange-{storage_cluster_name}")
}

/// Name of the exchanged copy in the destination cluster's hub namespace
///
/// Encodes the origin so one destination namespace can hold credentials from
/// several source clusters.
pub fn exchanged_secret_name(source_cluster: &str, storage_cluster_name: &str) -> String {
    format!("{source_cluster}-{storage_cluster_name}-token")
}

/// SHA-256 fingerprint of a secret's payload
///
/// Keys are hashed in map order with NUL separators so renaming a key or
/// reshuffling values changes the fingerprint.
pub fn fingerprint(secret: &Secret) -> String {
    let mut hasher = Sha256::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(&value.0);
            hasher.update([0u8]);
        }
    }
    format!("{:x}", hasher.finalize())
}

fn fingerprint_annotation(secret: &Secret) -> Option<&str> {
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(FINGERPRINT_ANNOTATION))
        .map(String::as_str)
}

/// Build the exchanged copy of a source secret for the destination namespace
fn build_exchanged_secret(
    peer_name: &str,
    source: &PeerRef,
    destination: &PeerRef,
    payload: &Secret,
    fp: &str,
) -> Secret {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(MIRROR_PEER_LABEL.to_string(), peer_name.to_string());
    labels.insert(
        SECRET_TYPE_LABEL.to_string(),
        SECRET_TYPE_EXCHANGED.to_string(),
    );

    let mut annotations = std::collections::BTreeMap::new();
    annotations.insert(FINGERPRINT_ANNOTATION.to_string(), fp.to_string());
    annotations.insert(
        SOURCE_CLUSTER_ANNOTATION.to_string(),
        source.cluster_name.clone(),
    );

    Secret {
        metadata: ObjectMeta {
            name: Some(exchanged_secret_name(
                &source.cluster_name,
                &source.storage_cluster_ref.name,
            )),
            namespace: Some(destination.cluster_name.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: payload.data.clone(),
        ..Default::default()
    }
}

/// Remove exchanged credentials that no current pair accounts for
///
/// A spec update can drop a cluster from the peering; credentials previously
/// published to or from that cluster are stale and must not outlive the
/// membership that produced them. Expected copies are recomputed from the
/// current spec and everything else carrying this peer's label is deleted.
pub async fn prune_stale(peer: &MirrorPeer, store: &dyn SecretStore) -> Result<(), Error> {
    let peer_name = peer.name_any();

    let expected: std::collections::BTreeSet<(String, String)> = peer
        .spec
        .ordered_pairs()
        .into_iter()
        .map(|(source, destination)| {
            (
                destination.cluster_name.clone(),
                exchanged_secret_name(&source.cluster_name, &source.storage_cluster_ref.name),
            )
        })
        .collect();

    for secret in store.list_exchanged(&peer_name).await? {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        if !expected.contains(&(namespace.clone(), name.clone())) {
            info!(
                peer = %peer_name,
                namespace = %namespace,
                secret = %name,
                "pruning stale exchanged credential"
            );
            store.delete(&namespace, &name).await?;
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Default)]
struct AttemptState {
    count: u32,
    last_fingerprint: Option<String>,
}

/// Coordinates credential exchanges for all pairs of a MirrorPeer
///
/// Attempt counters live in memory only; the cap bounds API and log churn on
/// a broken pair, while fingerprints keep restarts safe.
#[derive(Default)]
pub struct ExchangeCoordinator {
    attempts: DashMap<String, AttemptState>,
}

impl ExchangeCoordinator {
    /// Create a new coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Run all pairwise exchanges for a MirrorPeer
    ///
    /// Skips publication entirely when the peer is not Ready, the readiness
    /// was observed at a stale generation, or the peering is in Manual mode.
    /// Each pair is attempted independently; the returned statuses aggregate
    /// into the MirrorPeer's status block.
    pub async fn exchange(
        &self,
        peer: &MirrorPeer,
        readiness: &PeerReadiness,
        store: &dyn SecretStore,
    ) -> Vec<PairExchangeStatus> {
        let peer_name = peer.name_any();
        let pairs = peer.spec.ordered_pairs();

        if peer.spec.secret_exchange_mode == SecretExchangeMode::Manual {
            debug!(peer = %peer_name, "manual exchange mode, skipping publication");
            return pairs
                .iter()
                .map(|(s, d)| pair_status(s, d, ExchangeState::Skipped, None))
                .collect();
        }

        let generation = peer.metadata.generation.unwrap_or(0);
        if !readiness.ready || readiness.observed_generation != generation {
            debug!(
                peer = %peer_name,
                ready = readiness.ready,
                observed = readiness.observed_generation,
                generation,
                "peer not ready for exchange"
            );
            return pairs
                .iter()
                .map(|(s, d)| pair_status(s, d, ExchangeState::Pending, None))
                .collect();
        }

        let mut statuses = Vec::with_capacity(pairs.len());
        for (source, destination) in pairs {
            statuses.push(
                self.exchange_pair(&peer_name, source, destination, store)
                    .await,
            );
        }
        statuses
    }

    /// Drop all attempt counters for a peer (spec change or finalization)
    pub fn forget_peer(&self, peer_name: &str) {
        let prefix = format!("{peer_name}/");
        self.attempts.retain(|key, _| !key.starts_with(&prefix));
    }

    async fn exchange_pair(
        &self,
        peer_name: &str,
        source: &PeerRef,
        destination: &PeerRef,
        store: &dyn SecretStore,
    ) -> PairExchangeStatus {
        let key = format!(
            "{peer_name}/{}->{}",
            source.cluster_name, destination.cluster_name
        );
        let source_name = source_secret_name(&source.storage_cluster_ref.name);

        // Fetch the source credential the addon agent reported
        let payload = match store.get(&source.cluster_name, &source_name).await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                let err = Error::credential_unavailable(format!(
                    "secret {}/{} not reported yet",
                    source.cluster_name, source_name
                ));
                return self.record_failure(&key, source, destination, &err, None);
            }
            Err(e) => return self.record_failure(&key, source, destination, &e, None),
        };

        let fp = fingerprint(&payload);

        // A rotated credential resets the attempt budget; an exhausted budget
        // for the same fingerprint stays Failed without another attempt.
        {
            let mut entry = self.attempts.entry(key.clone()).or_default();
            if entry.last_fingerprint.as_deref() != Some(fp.as_str()) {
                entry.count = 0;
                entry.last_fingerprint = Some(fp.clone());
            }
            if entry.count >= MAX_EXCHANGE_ATTEMPTS {
                return pair_status(source, destination, ExchangeState::Failed, Some(fp));
            }
        }

        // Compare against the destination copy; equal fingerprints are a no-op
        let dest_name =
            exchanged_secret_name(&source.cluster_name, &source.storage_cluster_ref.name);
        match store.get(&destination.cluster_name, &dest_name).await {
            Ok(Some(existing)) if fingerprint_annotation(&existing) == Some(fp.as_str()) => {
                self.attempts.remove(&key);
                return pair_status(source, destination, ExchangeState::Exchanged, Some(fp));
            }
            Ok(_) => {}
            Err(e) => return self.record_failure(&key, source, destination, &e, Some(fp)),
        }

        let secret = build_exchanged_secret(peer_name, source, destination, &payload, &fp);
        match store.apply(&secret).await {
            Ok(()) => {
                info!(
                    peer = %peer_name,
                    source = %source.cluster_name,
                    destination = %destination.cluster_name,
                    "published exchanged credential"
                );
                self.attempts.remove(&key);
                pair_status(source, destination, ExchangeState::Exchanged, Some(fp))
            }
            Err(e) => self.record_failure(&key, source, destination, &e, Some(fp)),
        }
    }

    fn record_failure(
        &self,
        key: &str,
        source: &PeerRef,
        destination: &PeerRef,
        error: &Error,
        fp: Option<String>,
    ) -> PairExchangeStatus {
        let mut entry = self.attempts.entry(key.to_string()).or_default();
        entry.count += 1;
        let state = if entry.count >= MAX_EXCHANGE_ATTEMPTS {
            ExchangeState::Failed
        } else {
            ExchangeState::Pending
        };

        warn!(
            source = %source.cluster_name,
            destination = %destination.cluster_name,
            attempt = entry.count,
            error = %error,
            "credential exchange attempt failed"
        );

        pair_status(source, destination, state, fp)
    }
}

fn pair_status(
    source: &PeerRef,
    destination: &PeerRef,
    state: ExchangeState,
    fingerprint: Option<String>,
) -> PairExchangeStatus {
    PairExchangeStatus {
        source: source.cluster_name.clone(),
        destination: destination.cluster_name.clone(),
        state,
        fingerprint,
    }
}
