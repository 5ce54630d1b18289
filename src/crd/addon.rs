//! Typed bindings for the substrate's per-cluster addon installation records
//!
//! The multi-cluster substrate keys addon installations on (cluster namespace,
//! addon name) and reports the agent's health back through the record's
//! status. The schema is owned by the substrate; this operator owns the
//! records' lifecycle for the token-exchange addon.
//!
//! A record is shared by every MirrorPeer that references its cluster. The
//! owning peers are tracked as a back-reference set in the
//! [`PEERS_ANNOTATION`](crate::PEERS_ANNOTATION) annotation; a record is
//! deleted only when that set empties.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AddonPhase, Condition};
use crate::PEERS_ANNOTATION;

/// Specification for a per-cluster addon installation record
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "addon.mirrormesh.dev",
    version = "v1alpha1",
    kind = "ClusterAddOn",
    plural = "clusteraddons",
    status = "ClusterAddOnStatus",
    namespaced,
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.installNamespace"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAddOnSpec {
    /// Namespace the addon agent is installed into on the member cluster
    pub install_namespace: String,
}

/// Status reported by the substrate for an addon installation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAddOnStatus {
    /// Reported health of the addon agent
    #[serde(default)]
    pub phase: AddonPhase,

    /// Conditions reported by the substrate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ClusterAddOn {
    /// Reported phase, Unknown when the substrate has not written status yet
    pub fn phase(&self) -> AddonPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// The MirrorPeer names referencing this record, parsed from the
    /// back-reference annotation
    pub fn peer_refs(&self) -> Vec<String> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(PEERS_ANNOTATION))
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns true if the given MirrorPeer references this record
    pub fn is_referenced_by(&self, peer_name: &str) -> bool {
        self.peer_refs().iter().any(|p| p == peer_name)
    }

    /// Replace the back-reference set, keeping it sorted and deduplicated
    pub fn set_peer_refs(&mut self, mut refs: Vec<String>) {
        refs.sort();
        refs.dedup();
        let annotations: &mut BTreeMap<String, String> =
            self.metadata.annotations.get_or_insert_with(BTreeMap::new);
        if refs.is_empty() {
            annotations.remove(PEERS_ANNOTATION);
        } else {
            annotations.insert(PEERS_ANNOTATION.to_string(), refs.join(","));
        }
    }
}
