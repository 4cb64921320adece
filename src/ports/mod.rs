pub mod http_client;
pub mod interceptor;
pub mod service_discovery;

pub use http_client::{Body, BoxError, HttpClient, HttpClientError, HttpClientResult};
pub use interceptor::{Interceptor, Next};
pub use service_discovery::{DiscoveryError, DiscoveryResult, ServiceDiscoveryProvider};
