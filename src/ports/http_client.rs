use std::time::Duration;

use async_trait::async_trait;
use hyper::{Request, Response};
use thiserror::Error;

/// Body type carried through the dispatch pipeline
pub type Body = axum::body::Body;

/// Boxed error for faults raised by custom interceptors or transports
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Faults raised while sending a request downstream.
///
/// These never leave the engine as-is: the error translator maps each one onto
/// a [`crate::core::ErrorKind`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The per-call timeout fired before the downstream answered
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// The caller aborted the request
    #[error("Request canceled by caller")]
    Canceled,

    /// The route's circuit breaker rejected the call
    #[error("Circuit is open for route '{route}'")]
    CircuitOpen {
        /// Route key owning the breaker
        route: String,
    },

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Anything raised by a custom interceptor or transport
    #[error(transparent)]
    Other(BoxError),
}

impl HttpClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Wrap an arbitrary error raised by user code.
    pub fn other<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Other(error.into())
    }
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to downstream services
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to a downstream instance
    ///
    /// # Arguments
    /// * `req` - The HTTP request, already addressed to the chosen instance
    ///
    /// # Returns
    /// A future that resolves to the downstream response or an error
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;
}
