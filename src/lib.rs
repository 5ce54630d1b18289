//! MirrorMesh - Kubernetes operator for cross-cluster storage mirroring peerings
//!
//! MirrorMesh runs on the hub cluster of a multi-cluster federation. Operators
//! declare a [`crd::MirrorPeer`] naming two or more managed clusters and their
//! storage clusters; MirrorMesh translates that single declarative object into
//! per-cluster token-exchange addon installations and the exchange of storage
//! connection credentials between the peered clusters.
//!
//! # Architecture
//!
//! MirrorMesh is a hub-side controller:
//! - Addon records live in each managed cluster's hub namespace; the substrate
//!   installs the addon agent on the member cluster and reports its phase back
//! - Credentials flow through hub namespaces: the addon agent publishes the
//!   source cluster's connection secret into its hub namespace, and MirrorMesh
//!   copies it into the destination cluster's hub namespace
//! - All cross-cluster effects are declared, never invoked: the operator only
//!   writes desired state and observes reported state
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (MirrorPeer, ClusterAddOn bindings)
//! - [`controller`] - MirrorPeer reconciliation logic
//! - [`addon`] - Addon provisioning (desired/actual diff, shared-record reference counting)
//! - [`readiness`] - Per-peer addon readiness aggregation
//! - [`exchange`] - Token exchange between peered clusters
//! - [`cleanup`] - Finalizer-driven teardown of addons and exchanged credentials
//! - [`retry`] - Backoff utilities for transient API failures
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod addon;
pub mod cleanup;
pub mod controller;
pub mod crd;
pub mod error;
pub mod exchange;
pub mod readiness;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared Constants
// =============================================================================
// Names and keys that span multiple resources. Values used by exactly one
// module stay local to that module.

/// Fixed name of the token-exchange addon record in each cluster namespace
///
/// The substrate keys addon installations on (cluster namespace, addon name),
/// so every MirrorPeer referencing a cluster shares this one record.
pub const TOKEN_EXCHANGE_ADDON: &str = "token-exchange";

/// Field manager name used for all server-side apply patches
pub const FIELD_MANAGER: &str = "mirrormesh-controller";

/// Annotation on addon records holding the back-reference set of owning
/// MirrorPeer names (sorted, comma-joined)
pub const PEERS_ANNOTATION: &str = "mirrormesh.dev/peers";

/// Label identifying the MirrorPeer a secret was exchanged for
pub const MIRROR_PEER_LABEL: &str = "mirrormesh.dev/mirror-peer";

/// Label distinguishing source-reported secrets from exchanged copies
pub const SECRET_TYPE_LABEL: &str = "mirrormesh.dev/secret-type";

/// Value of [`SECRET_TYPE_LABEL`] on secrets the addon agent reports
pub const SECRET_TYPE_SOURCE: &str = "source";

/// Value of [`SECRET_TYPE_LABEL`] on secrets this operator publishes
pub const SECRET_TYPE_EXCHANGED: &str = "exchanged";

/// Annotation carrying the SHA-256 fingerprint of an exchanged secret's payload
pub const FINGERPRINT_ANNOTATION: &str = "mirrormesh.dev/fingerprint";

/// Finalizer marking in-flight MirrorPeer cleanup
pub const CLEANUP_FINALIZER: &str = "mirrormesh.dev/cleanup";
