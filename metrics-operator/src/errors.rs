use std::time::Duration;

use crate::handlers::HandlerError;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_unauthorized(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }

    fn is_unauthorized(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 401 => true,
            _ => false,
        }
    }
}

/// Errors aborting a reconciliation. Problems caused by the metric's
/// configuration or its target cluster are reported in the metric's status
/// instead.
#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// An I/O operation did not complete within the reconcile deadline.
    #[error("{0} did not complete within {1:?}")]
    DeadlineExceeded(&'static str, Duration),
    /// Internal failure of a metric handler.
    #[error("{0}")]
    Handler(#[from] HandlerError),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

impl ControllerError {
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::Serde(_) => false,
            _ => true,
        }
    }
}
