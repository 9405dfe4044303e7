use thiserror::Error;

/// Credential verification failures.
///
/// Only `UpstreamUnavailable` is retryable; every other variant is terminal
/// for the handshake that presented the credential.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("no credential presented")]
    Missing,
    #[error("malformed credential: {0}")]
    Malformed(String),
    #[error("credential expired")]
    Expired,
    #[error("credential rejected by upstream: {0}")]
    RejectedByUpstream(String),
    #[error("upstream verification unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl AuthError {
    /// Whether the failure is worth retrying within the handshake deadline.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }
}
