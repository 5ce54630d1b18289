//! MirrorPeer Custom Resource Definition
//!
//! A MirrorPeer declares a storage mirroring peering between two or more
//! managed clusters. The controller derives per-cluster addon records from it
//! and, once every addon is Available, exchanges storage connection
//! credentials between the peered clusters.

use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    CleanupPhase, ClusterReadiness, Condition, MirrorPeerPhase, PairExchangeStatus, PeerRef,
    SecretExchangeMode,
};

/// Specification for a MirrorPeer
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "mirrormesh.dev",
    version = "v1alpha1",
    kind = "MirrorPeer",
    plural = "mirrorpeers",
    shortname = "mp",
    status = "MirrorPeerStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.secretExchangeMode"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MirrorPeerSpec {
    /// Clusters participating in this peering
    pub items: Vec<PeerRef>,

    /// How exchanged credentials are propagated (defaults to Automatic)
    #[serde(default)]
    pub secret_exchange_mode: SecretExchangeMode,
}

impl MirrorPeerSpec {
    /// Validate the peering specification
    ///
    /// A peering needs at least two distinct clusters, each with a complete
    /// storage cluster reference. Validation failures are terminal; they are
    /// surfaced on status and not retried until the spec changes.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.items.len() < 2 {
            return Err(crate::Error::validation(
                "a MirrorPeer requires at least two clusters",
            ));
        }

        let mut seen = BTreeSet::new();
        for item in &self.items {
            item.validate()?;
            if !seen.insert(item.cluster_name.as_str()) {
                return Err(crate::Error::validation(format!(
                    "duplicate cluster name '{}' in items",
                    item.cluster_name
                )));
            }
        }

        Ok(())
    }

    /// Iterate the cluster names referenced by this peering
    pub fn cluster_names(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|i| i.cluster_name.as_str())
    }

    /// Find the PeerRef for a given cluster name
    pub fn peer_ref(&self, cluster_name: &str) -> Option<&PeerRef> {
        self.items.iter().find(|i| i.cluster_name == cluster_name)
    }

    /// All ordered (source, destination) pairs of this peering
    ///
    /// Every unordered pair yields two exchanges, one in each direction: each
    /// side needs the other's connection credential to establish its half of
    /// the mirror relationship.
    pub fn ordered_pairs(&self) -> Vec<(&PeerRef, &PeerRef)> {
        let mut pairs = Vec::new();
        for source in &self.items {
            for destination in &self.items {
                if source.cluster_name != destination.cluster_name {
                    pairs.push((source, destination));
                }
            }
        }
        pairs
    }
}

/// Status for a MirrorPeer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MirrorPeerStatus {
    /// Current phase of the peering lifecycle
    #[serde(default)]
    pub phase: MirrorPeerPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the peering state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Per-cluster addon readiness
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_readiness: Vec<ClusterReadiness>,

    /// Per-pair credential exchange state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pair_statuses: Vec<PairExchangeStatus>,

    /// Spec generation this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Progress of the cleanup state machine during deletion
    #[serde(default)]
    pub cleanup_phase: CleanupPhase,
}

impl MirrorPeerStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: MirrorPeerPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: MirrorPeerPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    ///
    /// Replaces any existing condition of the same type.
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Set per-cluster readiness and return self for chaining
    pub fn cluster_readiness(mut self, readiness: Vec<ClusterReadiness>) -> Self {
        self.cluster_readiness = readiness;
        self
    }

    /// Set per-pair exchange statuses and return self for chaining
    pub fn pair_statuses(mut self, pairs: Vec<PairExchangeStatus>) -> Self {
        self.pair_statuses = pairs;
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Set the cleanup phase and return self for chaining
    pub fn cleanup_phase(mut self, phase: CleanupPhase) -> Self {
        self.cleanup_phase = phase;
        self
    }
}
