//! Error taxonomy shared by collaborators and the reconciler.

use thiserror::Error;

/// Failure of a call against the cluster or the storage service.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not_found: {0}")]
    NotFound(String),
    /// Optimistic-concurrency failure (stale resourceVersion or precondition).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient: {0:#}")]
    Transient(#[source] anyhow::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn transient(e: impl Into<anyhow::Error>) -> Self {
        ClientError::Transient(e.into())
    }
}

/// The object cannot be turned into an archival payload as it stands.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ConversionError(pub String);

impl ConversionError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Outcome of a failed reconcile, as reported to the controller wiring.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid reconcile key {0:?} (expect <namespace>/<name>)")]
    InvalidKey(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient: {0:#}")]
    Transient(#[source] anyhow::Error),
    #[error("conversion: {0}")]
    Conversion(#[from] ConversionError),
    #[error("reconcile cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Whether the wiring should requeue the key with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Conflict(_) | ReconcileError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::InvalidKey(_) => "invalid_key",
            ReconcileError::Conflict(_) => "conflict",
            ReconcileError::Transient(_) => "transient",
            ReconcileError::Conversion(_) => "conversion",
            ReconcileError::Cancelled => "cancelled",
        }
    }
}

impl From<ClientError> for ReconcileError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Conflict(msg) => ReconcileError::Conflict(msg),
            ClientError::Transient(err) => ReconcileError::Transient(err),
            // Callers handle NotFound where it is benign; anywhere else it means
            // the world moved under us and a retry will observe the new state.
            ClientError::NotFound(what) => ReconcileError::Transient(anyhow::anyhow!("not found: {}", what)),
        }
    }
}
