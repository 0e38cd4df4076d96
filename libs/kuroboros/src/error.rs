//! Error kinds shared across the runtime, grounded in the ten error kinds
//! `kuroboros`'s original Python implementation distinguishes (see
//! `exceptions.py` and the `ApiException`/`RuntimeWarning` usages throughout
//! `controller.py`/`operator.py`/`reconciler.py`).

use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operator lacks an RBAC verb on the managed CRD. Fatal to
    /// controller construction.
    #[error("missing permission: {0}")]
    Permission(String),

    /// A validation webhook's CR type doesn't match its reconciler's CR
    /// type. Fatal to controller construction.
    #[error("webhook type mismatch: {0}")]
    WebhookTypeMismatch(String),

    /// `apiVersion` failed to parse against `^v(\d+)(?:(alpha|beta)(\d+))?$`
    /// or named an unknown stability token.
    #[error("invalid apiVersion `{0}`")]
    InvalidVersion(String),

    /// Any Kubernetes API failure, including 404s (inspected separately by
    /// callers that need to treat "not found" as non-fatal).
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Carries a backoff after which the reconciler should requeue.
    #[error("retriable error, backoff {backoff:?}")]
    Retriable { backoff: Duration },

    /// A logical invariant was violated; terminates the reconciler loop.
    #[error("unrecoverable error: {0}")]
    Unrecoverable(String),

    /// The user hook exceeded `reconcile_timeout`.
    #[error("reconcile timed out")]
    Timeout,

    /// A validation webhook rejected the request.
    #[error("validation rejected: {0}")]
    Validation(String),

    /// A mutation webhook rejected the request.
    #[error("mutation rejected: {0}")]
    Mutation(String),

    /// The admission request body didn't match the shape required for its
    /// operation (e.g. `object` missing on CREATE).
    #[error("malformed admission request: {0}")]
    RequestShape(String),

    /// Configuration file or environment could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// `ManagedResource` methods that require an API handle / GVI were
    /// called on an instance missing one, or on a read-only instance.
    #[error("operation requires a writable, bound resource: {0}")]
    NotWritable(String),

    /// Serialization failure translating between a typed CR and its JSON
    /// wire representation.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS certificate/key material could not be loaded.
    #[error("tls error: {0}")]
    Tls(String),

    /// Any condition the reconciler loop's `Unexpected` classification
    /// (spec error kind 10) covers — logged and, depending on call site,
    /// either retried with the previous interval or treated as fatal.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// `true` for the 404-shaped Kubernetes error that ends a reconciler
    /// loop (or a cleanup poll) without being fatal to the wider operator.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube(kube::Error::Api(resp)) if resp.code == 404
        )
    }
}
