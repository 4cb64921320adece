use async_trait::async_trait;
use thiserror::Error;

use crate::core::service::ServiceInstance;

/// Error type for discovery backend queries
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The backend could not be reached
    #[error("Request to discovery backend failed: {0}")]
    Request(String),

    /// The backend answered with a non-success status
    #[error("Discovery backend returned status {status} for {url}")]
    Status {
        /// The URL that was requested
        url: String,
        /// The status code returned by the backend
        status: u16,
    },

    /// The backend answered with something that could not be parsed
    #[error("Malformed discovery response: {0}")]
    Malformed(String),
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// ServiceDiscoveryProvider defines the port for resolving a service to live instances
#[async_trait]
pub trait ServiceDiscoveryProvider: Send + Sync + 'static {
    /// Return the current instances, in the backend's order.
    async fn get(&self) -> DiscoveryResult<Vec<ServiceInstance>>;
}
