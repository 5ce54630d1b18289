//! Per-MirrorPeer addon readiness aggregation
//!
//! Readiness is derived, never stored authoritatively: every reconcile
//! re-evaluates the watched addon records, so the aggregate is level-triggered.
//! A MirrorPeer is Ready the instant all of its clusters' addons report
//! Available and reverts the instant any one drops below Available.
//!
//! The [`ReadinessTracker`] caches the latest evaluation per peer so the
//! exchange coordinator can consult readiness together with the spec
//! generation it was computed from; acting on a stale generation is the
//! caller's bug to avoid.

use dashmap::DashMap;
use kube::ResourceExt;

use crate::crd::{AddonPhase, ClusterAddOn, ClusterReadiness, MirrorPeer};
use crate::TOKEN_EXCHANGE_ADDON;

/// Aggregated readiness of one MirrorPeer at a specific spec generation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerReadiness {
    /// True when every referenced cluster's addon reports Available
    pub ready: bool,

    /// Spec generation this readiness was computed from
    pub observed_generation: i64,

    /// Per-cluster reported phases, in spec order
    pub clusters: Vec<ClusterReadiness>,
}

/// Evaluate a MirrorPeer's readiness from its clusters' addon records
///
/// A record that is missing, misnamed, or has no reported status counts as
/// Unknown, which blocks readiness.
pub fn evaluate(peer: &MirrorPeer, records: &[ClusterAddOn]) -> PeerReadiness {
    let clusters: Vec<ClusterReadiness> = peer
        .spec
        .items
        .iter()
        .map(|item| {
            let phase = records
                .iter()
                .find(|r| {
                    r.namespace().as_deref() == Some(item.cluster_name.as_str())
                        && r.name_any() == TOKEN_EXCHANGE_ADDON
                })
                .map(|r| r.phase())
                .unwrap_or(AddonPhase::Unknown);
            ClusterReadiness {
                cluster_name: item.cluster_name.clone(),
                phase,
            }
        })
        .collect();

    PeerReadiness {
        ready: !clusters.is_empty() && clusters.iter().all(|c| c.phase == AddonPhase::Available),
        observed_generation: peer.metadata.generation.unwrap_or(0),
        clusters,
    }
}

/// Cache of the latest readiness evaluation per MirrorPeer
///
/// Advisory only: the watched objects remain the single source of truth, and
/// entries are refreshed on every reconcile and dropped on finalization.
#[derive(Default)]
pub struct ReadinessTracker {
    state: DashMap<String, PeerReadiness>,
}

impl ReadinessTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest evaluation for a peer
    pub fn observe(&self, peer_name: &str, readiness: PeerReadiness) {
        self.state.insert(peer_name.to_string(), readiness);
    }

    /// Latest readiness and the generation it was observed at
    ///
    /// Callers must compare the returned generation against the MirrorPeer's
    /// current spec generation before acting; a mismatch means the readiness
    /// predates a spec change.
    pub fn is_ready(&self, peer_name: &str) -> Option<(bool, i64)> {
        self.state
            .get(peer_name)
            .map(|r| (r.ready, r.observed_generation))
    }

    /// Drop a finalized peer's entry
    pub fn forget(&self, peer_name: &str) {
        self.state.remove(peer_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ClusterAddOnSpec, ClusterAddOnStatus, MirrorPeerSpec, PeerRef, SecretExchangeMode,
        StorageClusterRef,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sample_peer(name: &str, generation: i64, clusters: &[&str]) -> MirrorPeer {
        MirrorPeer {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: MirrorPeerSpec {
                items: clusters
                    .iter()
                    .map(|c| PeerRef {
                        cluster_name: c.to_string(),
                        storage_cluster_ref: StorageClusterRef {
                            name: "ocs".to_string(),
                            namespace: "openshift-storage".to_string(),
                        },
                    })
                    .collect(),
                secret_exchange_mode: SecretExchangeMode::Automatic,
            },
            status: None,
        }
    }

    fn addon(cluster: &str, phase: AddonPhase) -> ClusterAddOn {
        ClusterAddOn {
            metadata: ObjectMeta {
                name: Some(TOKEN_EXCHANGE_ADDON.to_string()),
                namespace: Some(cluster.to_string()),
                ..Default::default()
            },
            spec: ClusterAddOnSpec {
                install_namespace: "openshift-storage".to_string(),
            },
            status: Some(ClusterAddOnStatus {
                phase,
                conditions: Vec::new(),
            }),
        }
    }

    /// Story: the peer flips Ready the first instant all addons are Available
    #[test]
    fn story_all_available_is_ready() {
        let peer = sample_peer("mp1", 1, &["c1", "c2"]);
        let records = vec![
            addon("c1", AddonPhase::Available),
            addon("c2", AddonPhase::Available),
        ];

        let readiness = evaluate(&peer, &records);
        assert!(readiness.ready);
        assert_eq!(readiness.observed_generation, 1);
    }

    /// Story: one cluster below Available blocks the whole peer
    ///
    /// Degraded scenario from acceptance testing: c2 never reaches Available,
    /// the peer stays NotReady indefinitely, and c1's own phase is still
    /// reported accurately.
    #[test]
    fn story_one_degraded_blocks_readiness() {
        let peer = sample_peer("mp1", 1, &["c1", "c2"]);
        let records = vec![
            addon("c1", AddonPhase::Available),
            addon("c2", AddonPhase::Degraded),
        ];

        let readiness = evaluate(&peer, &records);
        assert!(!readiness.ready);
        assert_eq!(readiness.clusters[0].phase, AddonPhase::Available);
        assert_eq!(readiness.clusters[1].phase, AddonPhase::Degraded);
    }

    /// Story: a missing record counts as Unknown
    #[test]
    fn story_missing_record_is_unknown() {
        let peer = sample_peer("mp1", 1, &["c1", "c2"]);
        let records = vec![addon("c1", AddonPhase::Available)];

        let readiness = evaluate(&peer, &records);
        assert!(!readiness.ready);
        assert_eq!(readiness.clusters[1].phase, AddonPhase::Unknown);
    }

    /// Story: a record without status counts as Unknown
    #[test]
    fn story_statusless_record_is_unknown() {
        let peer = sample_peer("mp1", 1, &["c1", "c2"]);
        let mut statusless = addon("c2", AddonPhase::Available);
        statusless.status = None;
        let records = vec![addon("c1", AddonPhase::Available), statusless];

        let readiness = evaluate(&peer, &records);
        assert!(!readiness.ready);
    }

    /// Story: readiness reverts when an addon drops below Available
    ///
    /// Level-triggered: the second evaluation simply reflects the new record
    /// state; there is no edge memory to reset.
    #[test]
    fn story_readiness_reverts_on_regression() {
        let peer = sample_peer("mp1", 1, &["c1", "c2"]);
        let tracker = ReadinessTracker::new();

        let up = vec![
            addon("c1", AddonPhase::Available),
            addon("c2", AddonPhase::Available),
        ];
        tracker.observe("mp1", evaluate(&peer, &up));
        assert_eq!(tracker.is_ready("mp1"), Some((true, 1)));

        let down = vec![
            addon("c1", AddonPhase::Available),
            addon("c2", AddonPhase::Progressing),
        ];
        tracker.observe("mp1", evaluate(&peer, &down));
        assert_eq!(tracker.is_ready("mp1"), Some((false, 1)));
    }

    /// Story: the tracker exposes the generation for staleness checks
    ///
    /// A spec change bumps the generation; a caller holding readiness
    /// observed at generation 1 must not act on a generation-2 spec.
    #[test]
    fn story_stale_generation_detectable() {
        let tracker = ReadinessTracker::new();
        let old = sample_peer("mp1", 1, &["c1", "c2"]);
        let records = vec![
            addon("c1", AddonPhase::Available),
            addon("c2", AddonPhase::Available),
        ];
        tracker.observe("mp1", evaluate(&old, &records));

        let (ready, observed) = tracker.is_ready("mp1").unwrap();
        assert!(ready);

        let current = sample_peer("mp1", 2, &["c1", "c3"]);
        assert_ne!(observed, current.metadata.generation.unwrap());
    }

    #[test]
    fn forget_drops_entry() {
        let tracker = ReadinessTracker::new();
        let peer = sample_peer("mp1", 1, &["c1", "c2"]);
        tracker.observe("mp1", evaluate(&peer, &[]));
        assert!(tracker.is_ready("mp1").is_some());
        tracker.forget("mp1");
        assert!(tracker.is_ready("mp1").is_none());
    }
}
