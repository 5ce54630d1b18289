//! MirrorPeer controller implementation
//!
//! Reconciliation turns one declarative MirrorPeer into per-cluster addon
//! records and exchanged credentials: ensure the finalizer, validate, diff
//! addon records, aggregate readiness, exchange credentials, publish status.
//! Deletion runs the resumable cleanup state machine before the finalizer is
//! cleared.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::addon::{self, AddonStore, AddonStoreImpl};
use crate::cleanup::{self, CleanupProgress};
use crate::crd::{
    ClusterAddOn, Condition, ConditionStatus, ExchangeState, MirrorPeer, MirrorPeerPhase,
    MirrorPeerStatus, PairExchangeStatus,
};
use crate::exchange::{self, ExchangeCoordinator, SecretStore, SecretStoreImpl};
use crate::readiness::{self, PeerReadiness, ReadinessTracker};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, CLEANUP_FINALIZER, FIELD_MANAGER};

/// Requeue interval while a peer is still converging
const PENDING_REQUEUE: Duration = Duration::from_secs(15);

/// Requeue interval for a converged peer
const CONVERGED_REQUEUE: Duration = Duration::from_secs(60);

/// Requeue interval between cleanup steps
const CLEANUP_REQUEUE: Duration = Duration::from_secs(2);

/// Base delay for the error policy's exponential backoff
const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Ceiling for the error policy's exponential backoff
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Deadline for one reconciliation attempt
///
/// A stuck API call must not pin the worker; past the deadline the attempt
/// is abandoned in its last-persisted state and the peer requeues.
const RECONCILE_DEADLINE: Duration = Duration::from_secs(120);

/// Trait abstracting MirrorPeer API operations
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerApi: Send + Sync {
    /// Patch the status of a MirrorPeer
    async fn patch_status(&self, name: &str, status: &MirrorPeerStatus) -> Result<(), Error>;

    /// Add a finalizer to a MirrorPeer (no-op if present)
    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer from a MirrorPeer (no-op if absent)
    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error>;
}

/// Real MirrorPeer API implementation
pub struct PeerApiImpl {
    client: Client,
}

impl PeerApiImpl {
    /// Create a new PeerApiImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<MirrorPeer> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl PeerApi for PeerApiImpl {
    async fn patch_status(&self, name: &str, status: &MirrorPeerStatus) -> Result<(), Error> {
        let status_patch = serde_json::json!({
            "status": status
        });

        self.api()
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;

        Ok(())
    }

    // Finalizer edits are read-modify-write and can race the API server;
    // both directions retry briefly before surfacing the error for requeue.

    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        retry_with_backoff(
            &RetryConfig::with_max_attempts(3),
            "add_finalizer",
            || async {
                let peer = self.api().get(name).await?;
                let mut finalizers = peer.metadata.finalizers.unwrap_or_default();

                if finalizers.iter().any(|f| f == finalizer) {
                    return Ok(());
                }
                finalizers.push(finalizer.to_string());

                let patch = serde_json::json!({
                    "metadata": {
                        "finalizers": finalizers
                    }
                });
                self.api()
                    .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            },
        )
        .await
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        retry_with_backoff(
            &RetryConfig::with_max_attempts(3),
            "remove_finalizer",
            || async {
                let peer = self.api().get(name).await?;
                let finalizers: Vec<String> = peer
                    .metadata
                    .finalizers
                    .map(|f| f.into_iter().filter(|s| s != finalizer).collect())
                    .unwrap_or_default();

                let patch = serde_json::json!({
                    "metadata": {
                        "finalizers": finalizers
                    }
                });
                self.api()
                    .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            },
        )
        .await
    }
}

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls and holds resources
/// that are expensive to create, plus the advisory readiness and attempt
/// registries.
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client).build();
/// ```
pub struct Context {
    /// MirrorPeer API operations (trait object for testability)
    pub peers: Arc<dyn PeerApi>,
    /// Addon record operations
    pub addons: Arc<dyn AddonStore>,
    /// Secret operations
    pub secrets: Arc<dyn SecretStore>,
    /// Readiness cache, refreshed on every reconcile
    pub readiness: ReadinessTracker,
    /// Credential exchange coordinator with per-pair attempt budgets
    pub exchange: ExchangeCoordinator,
    /// Consecutive reconcile failures per peer, for error backoff
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a new controller context with the given Kubernetes client
    ///
    /// This is a convenience method equivalent to `Context::builder(client).build()`.
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        peers: Arc<dyn PeerApi>,
        addons: Arc<dyn AddonStore>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            peers,
            addons,
            secrets,
            readiness: ReadinessTracker::new(),
            exchange: ExchangeCoordinator::new(),
            failures: DashMap::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    peers: Option<Arc<dyn PeerApi>>,
    addons: Option<Arc<dyn AddonStore>>,
    secrets: Option<Arc<dyn SecretStore>>,
}

impl ContextBuilder {
    /// Create a new builder with the given Kubernetes client
    fn new(client: Client) -> Self {
        Self {
            client,
            peers: None,
            addons: None,
            secrets: None,
        }
    }

    /// Override the MirrorPeer API (primarily for testing)
    pub fn peer_api(mut self, peers: Arc<dyn PeerApi>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Override the addon store (primarily for testing)
    pub fn addon_store(mut self, addons: Arc<dyn AddonStore>) -> Self {
        self.addons = Some(addons);
        self
    }

    /// Override the secret store (primarily for testing)
    pub fn secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            peers: self
                .peers
                .unwrap_or_else(|| Arc::new(PeerApiImpl::new(self.client.clone()))),
            addons: self
                .addons
                .unwrap_or_else(|| Arc::new(AddonStoreImpl::new(self.client.clone()))),
            secrets: self
                .secrets
                .unwrap_or_else(|| Arc::new(SecretStoreImpl::new(self.client.clone()))),
            readiness: ReadinessTracker::new(),
            exchange: ExchangeCoordinator::new(),
            failures: DashMap::new(),
        }
    }
}

/// Check if a peer carries the cleanup finalizer
fn has_finalizer(peer: &MirrorPeer) -> bool {
    peer.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.contains(&CLEANUP_FINALIZER.to_string()))
}

/// Fetch the addon records for every cluster a peer references
async fn fetch_records(
    peer: &MirrorPeer,
    addons: &dyn AddonStore,
) -> Result<Vec<ClusterAddOn>, Error> {
    let mut records = Vec::with_capacity(peer.spec.items.len());
    for item in &peer.spec.items {
        if let Some(record) = addons.get(&item.cluster_name).await? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Compose the MirrorPeer status from this reconcile's observations
fn compose_status(
    peer: &MirrorPeer,
    readiness: &PeerReadiness,
    pairs: Vec<PairExchangeStatus>,
) -> MirrorPeerStatus {
    let any_failed = pairs.iter().any(|p| p.state == ExchangeState::Failed);
    let all_done = !pairs.is_empty()
        && pairs
            .iter()
            .all(|p| matches!(p.state, ExchangeState::Exchanged | ExchangeState::Skipped));

    let (phase, message) = if any_failed {
        (
            MirrorPeerPhase::Failed,
            "one or more credential exchanges exhausted their attempts".to_string(),
        )
    } else if readiness.ready && all_done {
        (
            MirrorPeerPhase::ExchangedSecret,
            "all credentials exchanged".to_string(),
        )
    } else {
        (
            MirrorPeerPhase::ExchangingSecret,
            "waiting for addons and credential exchange".to_string(),
        )
    };

    let ready_condition = if readiness.ready {
        Condition::new(
            "Ready",
            ConditionStatus::True,
            "AllAddonsAvailable",
            "all referenced clusters report Available addons",
        )
    } else {
        Condition::new(
            "Ready",
            ConditionStatus::False,
            "AddonsNotAvailable",
            "one or more referenced clusters are not Available",
        )
    };

    let degraded_condition = if any_failed {
        Condition::new(
            "ExchangeDegraded",
            ConditionStatus::True,
            "ExchangeAttemptsExhausted",
            "one or more pairs exhausted their exchange attempts",
        )
    } else {
        Condition::new(
            "ExchangeDegraded",
            ConditionStatus::False,
            "ExchangesHealthy",
            "no pair has exhausted its exchange attempts",
        )
    };

    MirrorPeerStatus::with_phase(phase)
        .message(message)
        .condition(ready_condition)
        .condition(degraded_condition)
        .cluster_readiness(readiness.clusters.clone())
        .pair_statuses(pairs)
        .observed_generation(peer.metadata.generation)
}

/// Reconcile a MirrorPeer resource
///
/// Observes the current addon and secret state, converges it toward the
/// peering the spec declares, and publishes the aggregate into status. The
/// attempt is bounded by [`RECONCILE_DEADLINE`]; past it the peer requeues
/// in its last-persisted state.
///
/// # Arguments
///
/// * `peer` - The MirrorPeer resource to reconcile
/// * `ctx` - Shared controller context
///
/// # Returns
///
/// Returns an `Action` indicating when to requeue the resource, or an error
/// if reconciliation failed.
#[instrument(skip(peer, ctx), fields(peer = %peer.name_any()))]
pub async fn reconcile(peer: Arc<MirrorPeer>, ctx: Arc<Context>) -> Result<Action, Error> {
    match tokio::time::timeout(RECONCILE_DEADLINE, reconcile_peer(peer, ctx)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("reconciliation attempt exceeded deadline, requeueing");
            Ok(Action::requeue(PENDING_REQUEUE))
        }
    }
}

async fn reconcile_peer(peer: Arc<MirrorPeer>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = peer.name_any();
    info!("reconciling mirror peer");

    // Handle deletion via the cleanup state machine
    if peer.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&peer, &ctx).await;
    }

    // The finalizer must be in place before any cross-cluster state exists
    if !has_finalizer(&peer) {
        info!("adding cleanup finalizer");
        ctx.peers.add_finalizer(&name, CLEANUP_FINALIZER).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // Validate the peering spec
    if let Err(e) = peer.spec.validate() {
        warn!(error = %e, "mirror peer validation failed");
        let status = MirrorPeerStatus::with_phase(MirrorPeerPhase::Failed)
            .message(e.to_string())
            .condition(Condition::new(
                "Ready",
                ConditionStatus::False,
                "ValidationFailed",
                e.to_string(),
            ))
            .observed_generation(peer.metadata.generation);
        ctx.peers.patch_status(&name, &status).await?;
        // Don't requeue for validation errors - they require spec changes
        return Ok(Action::await_change());
    }

    // A spec change invalidates the previous exchange attempt budgets
    let observed = peer.status.as_ref().and_then(|s| s.observed_generation);
    if observed != peer.metadata.generation {
        debug!(?observed, generation = ?peer.metadata.generation, "spec changed, resetting exchange attempts");
        ctx.exchange.forget_peer(&name);
    }

    // Converge addon records toward the spec
    addon::provision(&peer, ctx.addons.as_ref()).await?;

    // Credentials published for clusters no longer in the spec are stale
    exchange::prune_stale(&peer, ctx.secrets.as_ref()).await?;

    // Aggregate readiness from the records' reported phases
    let records = fetch_records(&peer, ctx.addons.as_ref()).await?;
    let peer_readiness = readiness::evaluate(&peer, &records);
    ctx.readiness.observe(&name, peer_readiness.clone());

    // Exchange credentials for every ready pair
    let pairs = ctx
        .exchange
        .exchange(&peer, &peer_readiness, ctx.secrets.as_ref())
        .await;

    let status = compose_status(&peer, &peer_readiness, pairs);
    let converged = status.phase == MirrorPeerPhase::ExchangedSecret;
    ctx.peers.patch_status(&name, &status).await?;
    ctx.failures.remove(&name);

    if converged {
        debug!("mirror peer converged");
        Ok(Action::requeue(CONVERGED_REQUEUE))
    } else {
        Ok(Action::requeue(PENDING_REQUEUE))
    }
}

/// Handle MirrorPeer deletion through the resumable cleanup state machine
///
/// One cleanup step advances per invocation; the new phase is persisted
/// before requeueing so a crash resumes at the recorded step. The finalizer
/// is removed only after every step has completed.
async fn handle_deletion(peer: &MirrorPeer, ctx: &Context) -> Result<Action, Error> {
    let name = peer.name_any();

    // If no finalizer, nothing to do
    if !has_finalizer(peer) {
        debug!(peer = %name, "no finalizer, allowing deletion");
        return Ok(Action::await_change());
    }

    // Surface the Deleting phase on first entry
    let current_phase = peer.status.as_ref().map(|s| s.phase.clone());
    if current_phase != Some(MirrorPeerPhase::Deleting) {
        let status = peer
            .status
            .clone()
            .unwrap_or_default()
            .phase(MirrorPeerPhase::Deleting)
            .message("tearing down addons and exchanged credentials");
        ctx.peers.patch_status(&name, &status).await?;
    }

    match cleanup::run(peer, ctx.addons.as_ref(), ctx.secrets.as_ref()).await? {
        CleanupProgress::Advanced(phase) => {
            info!(peer = %name, phase = %phase, "cleanup step complete");
            let status = peer
                .status
                .clone()
                .unwrap_or_default()
                .phase(MirrorPeerPhase::Deleting)
                .cleanup_phase(phase);
            ctx.peers.patch_status(&name, &status).await?;
            Ok(Action::requeue(CLEANUP_REQUEUE))
        }
        CleanupProgress::Finished => {
            info!(peer = %name, "cleanup finished, removing finalizer");
            ctx.readiness.forget(&name);
            ctx.exchange.forget_peer(&name);
            ctx.failures.remove(&name);
            ctx.peers.remove_finalizer(&name, CLEANUP_FINALIZER).await?;
            Ok(Action::await_change())
        }
    }
}

/// Error policy for the controller
///
/// Called when reconciliation fails. Terminal errors wait for a spec change;
/// everything else requeues with exponential backoff per peer, reset on the
/// next successful reconcile.
pub fn error_policy(peer: Arc<MirrorPeer>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = peer.name_any();
    error!(?error, peer = %name, "reconciliation failed");

    if error.is_terminal() {
        return Action::await_change();
    }

    let mut entry = ctx.failures.entry(name).or_insert(0);
    *entry += 1;
    let exponent = entry.value().saturating_sub(1).min(10);
    let delay = BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_MAX);

    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addon::MockAddonStore;
    use crate::crd::{
        AddonPhase, CleanupPhase, ClusterAddOnSpec, ClusterAddOnStatus, MirrorPeerSpec, PeerRef,
        SecretExchangeMode, StorageClusterRef,
    };
    use crate::exchange::MockSecretStore;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;
    use std::sync::{Arc as StdArc, Mutex};

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn peer_ref(cluster: &str) -> PeerRef {
        PeerRef {
            cluster_name: cluster.to_string(),
            storage_cluster_ref: StorageClusterRef {
                name: "ocs".to_string(),
                namespace: "openshift-storage".to_string(),
            },
        }
    }

    fn sample_peer(name: &str) -> MirrorPeer {
        MirrorPeer {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                generation: Some(1),
                finalizers: Some(vec![CLEANUP_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: MirrorPeerSpec {
                items: vec![peer_ref("cluster1"), peer_ref("cluster2")],
                secret_exchange_mode: SecretExchangeMode::Automatic,
            },
            status: None,
        }
    }

    fn invalid_peer(name: &str) -> MirrorPeer {
        let mut peer = sample_peer(name);
        peer.spec.items.truncate(1);
        peer
    }

    fn deleting_peer(name: &str, cleanup_phase: CleanupPhase) -> MirrorPeer {
        let mut peer = sample_peer(name);
        peer.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        peer.status = Some(
            MirrorPeerStatus::with_phase(MirrorPeerPhase::Deleting).cleanup_phase(cleanup_phase),
        );
        peer
    }

    fn available_addon(cluster: &str, peers: &str) -> ClusterAddOn {
        let mut annotations = BTreeMap::new();
        annotations.insert(crate::PEERS_ANNOTATION.to_string(), peers.to_string());
        ClusterAddOn {
            metadata: ObjectMeta {
                name: Some(crate::TOKEN_EXCHANGE_ADDON.to_string()),
                namespace: Some(cluster.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: ClusterAddOnSpec {
                install_namespace: "openshift-storage".to_string(),
            },
            status: Some(ClusterAddOnStatus {
                phase: AddonPhase::Available,
                conditions: Vec::new(),
            }),
        }
    }

    fn source_secret(cluster: &str) -> Secret {
        let mut data = BTreeMap::new();
        data.insert("token".to_string(), ByteString(b"token-data".to_vec()));
        Secret {
            metadata: ObjectMeta {
                name: Some("token-exchange-ocs".to_string()),
                namespace: Some(cluster.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    /// Captured status updates for verification without coupling tests to
    /// mockall call-matching internals.
    #[derive(Clone)]
    struct StatusCapture {
        updates: StdArc<Mutex<Vec<MirrorPeerStatus>>>,
    }

    impl StatusCapture {
        fn new() -> Self {
            Self {
                updates: StdArc::new(Mutex::new(Vec::new())),
            }
        }

        fn record(&self, status: MirrorPeerStatus) {
            self.updates.lock().unwrap().push(status);
        }

        fn last(&self) -> Option<MirrorPeerStatus> {
            self.updates.lock().unwrap().last().cloned()
        }

        fn last_phase(&self) -> Option<MirrorPeerPhase> {
            self.last().map(|s| s.phase)
        }
    }

    fn capturing_peer_api() -> (MockPeerApi, StatusCapture) {
        let capture = StatusCapture::new();
        let c = capture.clone();
        let mut peers = MockPeerApi::new();
        peers.expect_patch_status().returning(move |_, status| {
            c.record(status.clone());
            Ok(())
        });
        (peers, capture)
    }

    /// Addon store where both clusters' records exist and are Available
    fn converged_addon_store(peer_name: &'static str) -> MockAddonStore {
        let mut addons = MockAddonStore::new();
        addons
            .expect_get()
            .returning(move |ns| Ok(Some(available_addon(ns, peer_name))));
        addons.expect_list_referenced_by().returning(move |p| {
            Ok(vec![
                available_addon("cluster1", p),
                available_addon("cluster2", p),
            ])
        });
        addons
    }

    /// Secret store where sources exist and destinations accept publishes
    fn exchanging_secret_store() -> MockSecretStore {
        let mut secrets = MockSecretStore::new();
        secrets.expect_list_exchanged().returning(|_| Ok(vec![]));
        secrets.expect_get().returning(|ns, name| {
            if name.starts_with("token-exchange-") {
                Ok(Some(source_secret(ns)))
            } else {
                Ok(None)
            }
        });
        secrets.expect_apply().returning(|_| Ok(()));
        secrets
    }

    // =========================================================================
    // MirrorPeer Lifecycle Flow
    // =========================================================================
    //
    // These tests verify the complete peering lifecycle through the
    // reconciler. Each test is a story of a peer in a specific state and what
    // one reconcile pass does to it.
    //
    // Lifecycle: (finalizer added) -> ExchangingSecret -> ExchangedSecret
    //            Deleting runs the cleanup ratchet before the object goes away.
    //
    // Test Philosophy:
    // - Tests assert OBSERVABLE OUTCOMES (returned Action, captured status)
    // - Status capture verifies transitions without withf() coupling

    /// Story: the finalizer lands before any cross-cluster state
    ///
    /// A fresh peer has no finalizer. The first reconcile adds it and
    /// requeues; nothing else happens until the finalizer is persisted.
    #[tokio::test]
    async fn story_finalizer_added_first() {
        let mut peer = sample_peer("mp1");
        peer.metadata.finalizers = None;

        let mut peers = MockPeerApi::new();
        peers
            .expect_add_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));
        // Touching addons or secrets at this point would panic the mocks
        let ctx = StdArc::new(Context::for_testing(
            StdArc::new(peers),
            StdArc::new(MockAddonStore::new()),
            StdArc::new(MockSecretStore::new()),
        ));

        let action = reconcile(StdArc::new(peer), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }

    /// Story: an invalid spec fails terminally with no side effects
    ///
    /// One-cluster peerings are rejected: status goes Failed with a
    /// ValidationFailed condition and the peer waits for a spec change.
    #[tokio::test]
    async fn story_validation_failure_is_terminal() {
        let peer = invalid_peer("mp1");
        let (peers, capture) = capturing_peer_api();
        let ctx = StdArc::new(Context::for_testing(
            StdArc::new(peers),
            StdArc::new(MockAddonStore::new()),
            StdArc::new(MockSecretStore::new()),
        ));

        let action = reconcile(StdArc::new(peer), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(capture.last_phase(), Some(MirrorPeerPhase::Failed));
        let status = capture.last().unwrap();
        assert!(status
            .conditions
            .iter()
            .any(|c| c.reason == "ValidationFailed"));
    }

    /// Story: a converged ready peering reaches ExchangedSecret
    ///
    /// Both addon records exist and report Available, both sources are
    /// reported: the reconcile publishes both credentials and the status
    /// lands at ExchangedSecret with a True Ready condition.
    #[tokio::test]
    async fn story_ready_peer_reaches_exchanged() {
        let peer = sample_peer("mp1");
        let (peers, capture) = capturing_peer_api();
        let ctx = StdArc::new(Context::for_testing(
            StdArc::new(peers),
            StdArc::new(converged_addon_store("mp1")),
            StdArc::new(exchanging_secret_store()),
        ));

        let action = reconcile(StdArc::new(peer), ctx.clone()).await.unwrap();

        assert_eq!(action, Action::requeue(CONVERGED_REQUEUE));
        assert_eq!(capture.last_phase(), Some(MirrorPeerPhase::ExchangedSecret));

        let status = capture.last().unwrap();
        assert_eq!(status.pair_statuses.len(), 2);
        assert!(status
            .pair_statuses
            .iter()
            .all(|p| p.state == ExchangeState::Exchanged));
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(ctx.readiness.is_ready("mp1"), Some((true, 1)));
    }

    /// Story: a not-yet-Available addon keeps the peer ExchangingSecret
    ///
    /// cluster2's addon is still Progressing: readiness is all-or-nothing,
    /// so no credential is published and the phase stays ExchangingSecret.
    #[tokio::test]
    async fn story_progressing_addon_blocks_exchange() {
        let peer = sample_peer("mp1");
        let (peers, capture) = capturing_peer_api();

        let mut addons = MockAddonStore::new();
        addons.expect_get().returning(|ns| {
            let mut record = available_addon(ns, "mp1");
            if ns == "cluster2" {
                record.status = Some(ClusterAddOnStatus {
                    phase: AddonPhase::Progressing,
                    conditions: Vec::new(),
                });
            }
            Ok(Some(record))
        });
        addons
            .expect_list_referenced_by()
            .returning(|p| {
                Ok(vec![
                    available_addon("cluster1", p),
                    available_addon("cluster2", p),
                ])
            });

        // Only the stale-credential listing is expected; publishing before
        // readiness would panic the mock
        let mut secrets = MockSecretStore::new();
        secrets.expect_list_exchanged().returning(|_| Ok(vec![]));
        let ctx = StdArc::new(Context::for_testing(
            StdArc::new(peers),
            StdArc::new(addons),
            StdArc::new(secrets),
        ));

        let action = reconcile(StdArc::new(peer), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(PENDING_REQUEUE));
        assert_eq!(
            capture.last_phase(),
            Some(MirrorPeerPhase::ExchangingSecret)
        );
        let status = capture.last().unwrap();
        assert!(status
            .pair_statuses
            .iter()
            .all(|p| p.state == ExchangeState::Pending));
        assert!(status
            .conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == ConditionStatus::False));
    }

    /// Story: deletion advances the cleanup ratchet one step at a time
    ///
    /// First deletion pass: credentials are removed, the persisted phase
    /// advances to CredentialsRemoved, and the peer requeues. The finalizer
    /// stays until the ratchet finishes.
    #[tokio::test]
    async fn story_deletion_advances_cleanup_stepwise() {
        let peer = deleting_peer("mp1", CleanupPhase::Pending);
        let (peers, capture) = capturing_peer_api();

        let mut secrets = MockSecretStore::new();
        secrets.expect_list_exchanged().returning(|_| Ok(vec![]));

        let ctx = StdArc::new(Context::for_testing(
            StdArc::new(peers),
            StdArc::new(MockAddonStore::new()),
            StdArc::new(secrets),
        ));

        let action = reconcile(StdArc::new(peer), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(CLEANUP_REQUEUE));
        let status = capture.last().unwrap();
        assert_eq!(status.phase, MirrorPeerPhase::Deleting);
        assert_eq!(status.cleanup_phase, CleanupPhase::CredentialsRemoved);
    }

    /// Story: the finalizer is removed only after the last cleanup step
    #[tokio::test]
    async fn story_finalizer_removed_after_cleanup() {
        let peer = deleting_peer("mp1", CleanupPhase::AddonsReleased);

        let mut peers = MockPeerApi::new();
        peers
            .expect_remove_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = StdArc::new(Context::for_testing(
            StdArc::new(peers),
            StdArc::new(MockAddonStore::new()),
            StdArc::new(MockSecretStore::new()),
        ));

        let action = reconcile(StdArc::new(peer), ctx.clone()).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(ctx.readiness.is_ready("mp1").is_none());
    }

    /// Story: a peer deleted without a finalizer is left alone
    #[tokio::test]
    async fn story_deletion_without_finalizer_is_noop() {
        let mut peer = deleting_peer("mp1", CleanupPhase::Pending);
        peer.metadata.finalizers = None;

        let ctx = StdArc::new(Context::for_testing(
            StdArc::new(MockPeerApi::new()),
            StdArc::new(MockAddonStore::new()),
            StdArc::new(MockSecretStore::new()),
        ));

        let action = reconcile(StdArc::new(peer), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Error Policy
    // =========================================================================

    /// Transient failures back off exponentially per peer
    #[test]
    fn error_policy_backs_off_exponentially() {
        let ctx = StdArc::new(Context::for_testing(
            StdArc::new(MockPeerApi::new()),
            StdArc::new(MockAddonStore::new()),
            StdArc::new(MockSecretStore::new()),
        ));
        let peer = StdArc::new(sample_peer("mp1"));
        let err = Error::conflict("lost update race");

        assert_eq!(
            error_policy(peer.clone(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            error_policy(peer.clone(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(10))
        );
        assert_eq!(
            error_policy(peer.clone(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(20))
        );
    }

    /// The backoff is capped
    #[test]
    fn error_policy_caps_backoff() {
        let ctx = StdArc::new(Context::for_testing(
            StdArc::new(MockPeerApi::new()),
            StdArc::new(MockAddonStore::new()),
            StdArc::new(MockSecretStore::new()),
        ));
        let peer = StdArc::new(sample_peer("mp1"));
        let err = Error::conflict("lost update race");

        let mut last = Action::requeue(Duration::ZERO);
        for _ in 0..12 {
            last = error_policy(peer.clone(), &err, ctx.clone());
        }
        assert_eq!(last, Action::requeue(BACKOFF_MAX));
    }

    /// Terminal errors wait for a spec change instead of retrying
    #[test]
    fn error_policy_terminal_awaits_change() {
        let ctx = StdArc::new(Context::for_testing(
            StdArc::new(MockPeerApi::new()),
            StdArc::new(MockAddonStore::new()),
            StdArc::new(MockSecretStore::new()),
        ));
        let peer = StdArc::new(invalid_peer("mp1"));
        let err = Error::validation("too few clusters");

        assert_eq!(error_policy(peer, &err, ctx), Action::await_change());
    }
}
