//! Error types shared across the provisioning engine.

use thiserror::Error;

/// Errors surfaced by the provisioning engine and its collaborators.
#[derive(Debug, Error)]
pub enum ProxnestError {
    /// No active session with the outer hypervisor endpoint.
    #[error("not connected to a hypervisor endpoint")]
    NotConnected,

    /// The state machine refused to admit an operation.
    #[error("operation conflict: {0}")]
    OperationConflict(String),

    /// A required configuration field is absent or empty.
    #[error("missing precondition: {0}")]
    PreconditionMissing(String),

    /// Any failure reported by the hypervisor endpoint or the mirror.
    #[error("remote API error: {0}")]
    RemoteApi(String),

    /// Installer discovery yielded no matching image.
    #[error("no installer candidate found: {0}")]
    NoCandidateFound(String),

    /// No ISO authoring tool is available on this host.
    #[error("answer image authoring tool unavailable: {0}")]
    AuthoringToolUnavailable(String),

    /// Local or remote storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation inside the engine itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for ProxnestError {
    fn from(err: reqwest::Error) -> Self {
        ProxnestError::RemoteApi(err.to_string())
    }
}

pub type ProxnestResult<T> = Result<T, ProxnestError>;
