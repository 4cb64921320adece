//! Error taxonomy returned by the dispatch engine.
//!
//! Every failure crossing a component boundary is a [`DispatchError`]. The
//! external status-code mapper only needs [`DispatchError::kind`].
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Discriminant of a [`DispatchError`], used by the error translator table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorKind {
    DiscoveryProviderNotFound,
    DiscoveryBackendError,
    LoadBalancerNotFound,
    LoadBalancerMisconfigured,
    InterceptorNotFound,
    NoInstanceAvailable,
    ConnectionFailure,
    RequestTimedOut,
    RequestCanceled,
    CircuitOpen,
    UnknownDispatchError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors produced by the dispatch engine
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    /// No discovery factory is registered for the configured kind
    #[error("Unable to find service discovery provider for kind: '{0}'")]
    DiscoveryProviderNotFound(String),

    /// The discovery backend could not be queried or returned garbage
    #[error("Service discovery backend error: {0}")]
    DiscoveryBackendError(String),

    /// No balancer factory is registered for the configured kind
    #[error("Unable to find load balancer for kind: '{0}'")]
    LoadBalancerNotFound(String),

    /// The balancer kind is inconsistent with the resolved instances
    #[error("Load balancer misconfigured: {0}")]
    LoadBalancerMisconfigured(String),

    /// A route references an interceptor that was never registered
    #[error("Unable to find interceptor: '{0}'")]
    InterceptorNotFound(String),

    /// The resolved instance list was empty at lease time
    #[error("No downstream instance available for route '{0}'")]
    NoInstanceAvailable(String),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Request timed out: {0}")]
    RequestTimedOut(String),

    #[error("Request canceled: {0}")]
    RequestCanceled(String),

    /// The route's circuit breaker rejected the call without dispatching
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    #[error("Unknown dispatch error: {0}")]
    UnknownDispatchError(String),
}

impl DispatchError {
    /// Build an error of the given kind carrying a message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::DiscoveryProviderNotFound => Self::DiscoveryProviderNotFound(message),
            ErrorKind::DiscoveryBackendError => Self::DiscoveryBackendError(message),
            ErrorKind::LoadBalancerNotFound => Self::LoadBalancerNotFound(message),
            ErrorKind::LoadBalancerMisconfigured => Self::LoadBalancerMisconfigured(message),
            ErrorKind::InterceptorNotFound => Self::InterceptorNotFound(message),
            ErrorKind::NoInstanceAvailable => Self::NoInstanceAvailable(message),
            ErrorKind::ConnectionFailure => Self::ConnectionFailure(message),
            ErrorKind::RequestTimedOut => Self::RequestTimedOut(message),
            ErrorKind::RequestCanceled => Self::RequestCanceled(message),
            ErrorKind::CircuitOpen => Self::CircuitOpen(message),
            ErrorKind::UnknownDispatchError => Self::UnknownDispatchError(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DiscoveryProviderNotFound(_) => ErrorKind::DiscoveryProviderNotFound,
            Self::DiscoveryBackendError(_) => ErrorKind::DiscoveryBackendError,
            Self::LoadBalancerNotFound(_) => ErrorKind::LoadBalancerNotFound,
            Self::LoadBalancerMisconfigured(_) => ErrorKind::LoadBalancerMisconfigured,
            Self::InterceptorNotFound(_) => ErrorKind::InterceptorNotFound,
            Self::NoInstanceAvailable(_) => ErrorKind::NoInstanceAvailable,
            Self::ConnectionFailure(_) => ErrorKind::ConnectionFailure,
            Self::RequestTimedOut(_) => ErrorKind::RequestTimedOut,
            Self::RequestCanceled(_) => ErrorKind::RequestCanceled,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::UnknownDispatchError(_) => ErrorKind::UnknownDispatchError,
        }
    }
}

/// Result type for dispatch engine operations
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_constructor() {
        let kinds = [
            ErrorKind::DiscoveryProviderNotFound,
            ErrorKind::NoInstanceAvailable,
            ErrorKind::CircuitOpen,
            ErrorKind::UnknownDispatchError,
        ];
        for kind in kinds {
            assert_eq!(DispatchError::new(kind, "x").kind(), kind);
        }
    }

    #[test]
    fn test_display_includes_message() {
        let err = DispatchError::DiscoveryProviderNotFound("Wookie".to_string());
        assert_eq!(
            err.to_string(),
            "Unable to find service discovery provider for kind: 'Wookie'"
        );
    }
}
