pub mod circuit_breaker;
pub mod client_cache;
pub mod cookies;
pub mod dispatcher;
pub mod error;
pub mod error_translator;
pub mod load_balancer;
pub mod pipeline;
pub mod service;
pub mod service_discovery;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState, QosInterceptor};
pub use client_cache::{CacheStats, ClientCache, ClientLease, ClientSignature, DownstreamClient};
pub use cookies::CookieJar;
pub use dispatcher::{Dispatcher, RequestContext};
pub use error::{DispatchError, DispatchResult, ErrorKind};
pub use error_translator::ErrorTranslator;
pub use load_balancer::{BalancerRegistry, LoadBalancer, LoadBalancerHouse};
pub use pipeline::{InterceptorRegistry, PipelineBuilder, TransportFactory};
pub use service::{ServiceHostAndPort, ServiceInstance};
pub use service_discovery::{DiscoveryRegistry, ServiceEntryResolver};
