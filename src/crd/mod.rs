//! Custom Resource Definitions for MirrorMesh
//!
//! This module contains the MirrorPeer CRD owned by this operator and typed
//! bindings for the substrate's per-cluster addon installation records.

mod addon;
mod mirror_peer;
mod types;

pub use addon::{ClusterAddOn, ClusterAddOnSpec, ClusterAddOnStatus};
pub use mirror_peer::{MirrorPeer, MirrorPeerSpec, MirrorPeerStatus};
pub use types::{
    AddonPhase, CleanupPhase, ClusterReadiness, Condition, ConditionStatus, ExchangeState,
    MirrorPeerPhase, PairExchangeStatus, PeerRef, SecretExchangeMode, StorageClusterRef,
};
