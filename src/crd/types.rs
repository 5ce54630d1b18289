//! Supporting types for the MirrorPeer CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One cluster's participation in a MirrorPeer
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerRef {
    /// Name of the managed cluster (also its hub namespace)
    pub cluster_name: String,

    /// The storage cluster on that member cluster to mirror
    pub storage_cluster_ref: StorageClusterRef,
}

/// Reference to a storage cluster resource on a member cluster
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct StorageClusterRef {
    /// Name of the storage cluster resource
    pub name: String,

    /// Namespace of the storage cluster resource on the member cluster
    pub namespace: String,
}

impl PeerRef {
    /// Validates this peer reference
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.cluster_name.is_empty() {
            return Err(crate::Error::validation("clusterName must not be empty"));
        }
        if self.storage_cluster_ref.name.is_empty() || self.storage_cluster_ref.namespace.is_empty()
        {
            return Err(crate::Error::validation(format!(
                "storageClusterRef for cluster '{}' must have a name and namespace",
                self.cluster_name
            )));
        }
        Ok(())
    }
}

/// How exchanged credentials are propagated between peered clusters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SecretExchangeMode {
    /// The operator publishes credentials as soon as both sides are ready
    #[default]
    Automatic,
    /// Addons are provisioned and readiness tracked, but credentials are
    /// propagated by the operator's user out of band
    Manual,
}

impl std::fmt::Display for SecretExchangeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Automatic => write!(f, "Automatic"),
            Self::Manual => write!(f, "Manual"),
        }
    }
}

/// MirrorPeer lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum MirrorPeerPhase {
    /// Addons are being provisioned or credentials are still being exchanged
    #[default]
    ExchangingSecret,
    /// Every pair has an up-to-date exchanged credential
    ExchangedSecret,
    /// The spec is invalid or an exchange exhausted its attempts
    Failed,
    /// The peer is being torn down
    Deleting,
}

impl std::fmt::Display for MirrorPeerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExchangingSecret => write!(f, "ExchangingSecret"),
            Self::ExchangedSecret => write!(f, "ExchangedSecret"),
            Self::Failed => write!(f, "Failed"),
            Self::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Reported phase of a per-cluster addon installation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AddonPhase {
    /// The addon is being installed on the member cluster
    Progressing,
    /// The addon agent is running and healthy
    Available,
    /// The addon agent is installed but unhealthy
    Degraded,
    /// No status has been reported yet
    #[default]
    Unknown,
}

impl std::fmt::Display for AddonPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Progressing => write!(f, "Progressing"),
            Self::Available => write!(f, "Available"),
            Self::Degraded => write!(f, "Degraded"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Readiness of one cluster's addon, as seen from the MirrorPeer
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReadiness {
    /// Name of the managed cluster
    pub cluster_name: String,

    /// Reported addon phase for that cluster
    pub phase: AddonPhase,
}

/// State of one directional credential exchange
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExchangeState {
    /// Waiting for readiness or the source credential
    #[default]
    Pending,
    /// The destination copy matches the source fingerprint
    Exchanged,
    /// The exchange exhausted its attempts
    Failed,
    /// The peering is in manual mode; no credential is published
    Skipped,
}

impl std::fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Exchanged => write!(f, "Exchanged"),
            Self::Failed => write!(f, "Failed"),
            Self::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Status of one directional (source, destination) credential exchange
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PairExchangeStatus {
    /// Cluster the credential originates from
    pub source: String,

    /// Cluster the credential is published into
    pub destination: String,

    /// Current exchange state for this pair
    pub state: ExchangeState,

    /// SHA-256 fingerprint of the last published payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Progress marker for the resumable cleanup state machine
///
/// Persisted in status so a restart mid-cleanup resumes at the recorded step
/// instead of re-running earlier destructive steps.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CleanupPhase {
    /// Cleanup has not started (or the peer is not being deleted)
    #[default]
    Pending,
    /// All exchanged credentials for this peer have been removed
    CredentialsRemoved,
    /// All addon records have been released; finalizer may be cleared
    AddonsReleased,
}

impl std::fmt::Display for CleanupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::CredentialsRemoved => write!(f, "CredentialsRemoved"),
            Self::AddonsReleased => write!(f, "AddonsReleased"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, ExchangeDegraded)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the transition time set to now
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}
