//! Finalizer-driven teardown of a MirrorPeer's cross-cluster state
//!
//! Deleting a MirrorPeer must not leave exchanged credentials or addon
//! records behind, so deletion is intercepted by a finalizer and cleanup runs
//! as a small state machine persisted in `status.cleanup_phase`:
//!
//! ```text
//! Pending -> CredentialsRemoved -> AddonsReleased -> (finalizer cleared)
//! ```
//!
//! One step advances per reconcile invocation; a crash mid-cleanup resumes at
//! the recorded step instead of re-running earlier ones. Every step is
//! idempotent and treats the absence of its target objects as success — an
//! operator may have deleted addons or secrets by hand ahead of the
//! MirrorPeer itself. Cleanup errors are retried indefinitely; abandoning a
//! step would leak cross-cluster state.

use kube::ResourceExt;
use tracing::{debug, info};

use crate::addon::{self, AddonStore};
use crate::crd::{CleanupPhase, MirrorPeer};
use crate::exchange::SecretStore;
use crate::Error;

/// Result of one cleanup invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupProgress {
    /// A step completed; persist the new phase and requeue
    Advanced(CleanupPhase),
    /// All steps are complete; the finalizer may be cleared
    Finished,
}

/// Run the next cleanup step for a MirrorPeer being deleted
///
/// The current step is read from `status.cleanup_phase`; the caller persists
/// the phase returned in [`CleanupProgress::Advanced`] before requeueing, so
/// that completed steps are never re-entered after a restart.
pub async fn run(
    peer: &MirrorPeer,
    addons: &dyn AddonStore,
    secrets: &dyn SecretStore,
) -> Result<CleanupProgress, Error> {
    let name = peer.name_any();
    let phase = peer
        .status
        .as_ref()
        .map(|s| s.cleanup_phase.clone())
        .unwrap_or_default();

    match phase {
        CleanupPhase::Pending => {
            remove_exchanged_credentials(&name, secrets).await?;
            Ok(CleanupProgress::Advanced(CleanupPhase::CredentialsRemoved))
        }
        CleanupPhase::CredentialsRemoved => {
            release_addon_records(&name, addons).await?;
            Ok(CleanupProgress::Advanced(CleanupPhase::AddonsReleased))
        }
        CleanupPhase::AddonsReleased => {
            debug!(peer = %name, "cleanup complete");
            Ok(CleanupProgress::Finished)
        }
    }
}

/// Delete every exchanged credential this peer published
///
/// Secrets are found by label, not recomputed from the spec: the spec may
/// have shrunk since the credentials were published, and labels survive
/// membership changes.
async fn remove_exchanged_credentials(
    peer_name: &str,
    secrets: &dyn SecretStore,
) -> Result<(), Error> {
    let published = secrets.list_exchanged(peer_name).await?;
    if published.is_empty() {
        debug!(peer = %peer_name, "no exchanged credentials to remove");
        return Ok(());
    }

    for secret in published {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        info!(peer = %peer_name, namespace = %namespace, secret = %name, "removing exchanged credential");
        secrets.delete(&namespace, &name).await?;
    }
    Ok(())
}

/// Release every addon record this peer references
///
/// Shared records lose one back-reference; records referenced only by this
/// peer are deleted. A record already deleted out-of-band simply does not
/// appear in the listing, which is success.
async fn release_addon_records(peer_name: &str, addons: &dyn AddonStore) -> Result<(), Error> {
    let records = addons.list_referenced_by(peer_name).await?;
    if records.is_empty() {
        debug!(peer = %peer_name, "no addon records to release");
        return Ok(());
    }

    for record in records {
        addon::release(record, peer_name, addons).await?;
    }
    Ok(())
}
