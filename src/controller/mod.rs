//! Controller implementation for the MirrorPeer CRD
//!
//! This module contains the reconciliation logic for MirrorPeer resources.
//! Controllers follow the Kubernetes controller pattern with observe-diff-act
//! loops; all cross-cluster effects go through watched substrate objects.

mod mirror_peer;

pub use mirror_peer::{
    error_policy, reconcile, Context, ContextBuilder, PeerApi, PeerApiImpl,
};
