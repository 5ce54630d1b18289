//! Error types for the MirrorMesh operator

use thiserror::Error;

/// Main error type for MirrorMesh operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for MirrorPeer specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Source cluster has not reported its connection secret yet
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),

    /// Optimistic concurrency conflict on a shared addon record
    #[error("conflict: {0}")]
    Conflict(String),

    /// Cleanup step not yet confirmed
    #[error("cleanup error: {0}")]
    Cleanup(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a credential-unavailable error with the given message
    pub fn credential_unavailable(msg: impl Into<String>) -> Self {
        Self::CredentialUnavailable(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a cleanup error with the given message
    pub fn cleanup(msg: impl Into<String>) -> Self {
        Self::Cleanup(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Returns true if this error is terminal: retrying cannot resolve it
    /// and reconciliation should wait for a spec change instead.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation in Peering Operations
    // ==========================================================================
    //
    // These tests demonstrate how errors flow through the system during the
    // MirrorPeer lifecycle. Each error type represents a different failure
    // category with specific handling requirements in the reconcile loop.

    /// Story: spec validation catches malformed peerings before any side effects
    ///
    /// When a user creates a MirrorPeer with fewer than two clusters, the
    /// validation layer rejects it immediately with a clear message. No addon
    /// records are created for an invalid spec.
    #[test]
    fn story_validation_prevents_invalid_peering() {
        let err = Error::validation("a MirrorPeer requires at least two distinct clusters");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("at least two"));

        let err = Error::validation("duplicate cluster name 'cluster1' in items");
        assert!(err.to_string().contains("duplicate cluster name"));

        match Error::validation("any message") {
            Error::Validation(msg) => assert_eq!(msg, "any message"),
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: missing source credentials are a normal, retryable condition
    ///
    /// The addon agent publishes the source cluster's connection secret
    /// asynchronously. Until it appears, exchanges for that pair stay pending.
    #[test]
    fn story_credential_unavailable_is_retryable() {
        let err = Error::credential_unavailable(
            "secret token-exchange-ocs in namespace cluster1 not found",
        );
        assert!(err.to_string().contains("credential unavailable"));
        assert!(!err.is_terminal());
    }

    /// Story: conflicts on shared addon records are retried, not surfaced
    ///
    /// Two MirrorPeers referencing the same cluster may race on the shared
    /// addon record's back-reference annotation. The loser requeues.
    #[test]
    fn story_conflict_on_shared_record() {
        let err = Error::conflict("addon record cluster1/token-exchange changed since read");
        assert!(err.to_string().contains("conflict"));
        assert!(!err.is_terminal());
    }

    /// Story: errors are categorized for proper handling in the controller
    ///
    /// Only validation errors are terminal. Everything else is retried with
    /// backoff; cleanup errors are retried indefinitely because abandoning
    /// them would leak cross-cluster state.
    #[test]
    fn story_error_categorization_for_controller_handling() {
        assert!(Error::validation("bad spec").is_terminal());
        assert!(!Error::credential_unavailable("not yet").is_terminal());
        assert!(!Error::conflict("lost race").is_terminal());
        assert!(!Error::cleanup("secret still present").is_terminal());
        assert!(!Error::serialization("bad payload").is_terminal());
    }

    /// Story: error helper functions accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let dynamic_msg = format!("peer {} not found", "mirrorpeer1");
        let err = Error::validation(dynamic_msg);
        assert!(err.to_string().contains("mirrorpeer1"));

        let err = Error::cleanup("static message");
        assert!(err.to_string().contains("static message"));
    }
}
